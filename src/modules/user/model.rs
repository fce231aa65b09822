use bson::{oid::ObjectId, Bson, Document};
use serde::{Deserialize, Serialize};

pub const COLLECTION_NAME: &str = "users";

/// Dotted path of the sub-document removed by the null-token cleanup.
pub const VERIFICATION_TOKEN_PATH: &str = "kyc.verificationToken";
/// Dotted path of the indexed token.
pub const TOKEN_PATH: &str = "kyc.verificationToken.token";

/// A user record as written by the KYC portal.
///
/// Only the parts the repair touches are modelled; everything else on the
/// stored document is left alone.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyc: Option<Kyc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Kyc {
    pub status: String,
    #[serde(
        rename = "verificationToken",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub verification_token: Option<VerificationToken>,
}

/// `token` is serialized even when `None`, which stores an explicit null.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerificationToken {
    pub token: Option<String>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<bson::DateTime>,
}

impl User {
    /// A user whose `kyc` block has no `verificationToken` at all.
    pub fn without_token(email: &str) -> Self {
        Self {
            id: None,
            email: email.to_string(),
            kyc: Some(Kyc {
                status: "pending".to_string(),
                verification_token: None,
            }),
        }
    }

    pub fn with_token(email: &str, token: &str) -> Self {
        Self::with_verification_token(email, Some(token.to_string()))
    }

    pub fn with_null_token(email: &str) -> Self {
        Self::with_verification_token(email, None)
    }

    fn with_verification_token(email: &str, token: Option<String>) -> Self {
        Self {
            id: None,
            email: email.to_string(),
            kyc: Some(Kyc {
                status: "pending".to_string(),
                verification_token: Some(VerificationToken {
                    token,
                    expires_at: Some(bson::DateTime::now()),
                }),
            }),
        }
    }

    pub fn to_document(&self) -> Result<Document, bson::ser::Error> {
        bson::to_document(self)
    }
}

/// How a stored document carries `kyc.verificationToken.token`.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenState {
    Absent,
    Null,
    Value(Bson),
}

impl TokenState {
    pub fn of(doc: &Document) -> Self {
        match field_at(doc, TOKEN_PATH) {
            None => TokenState::Absent,
            Some(Bson::Null) => TokenState::Null,
            Some(value) => TokenState::Value(value.clone()),
        }
    }
}

/// Resolves a dotted path through nested sub-documents.
pub fn field_at<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Removes the field at a dotted path. Returns whether anything was removed.
pub fn remove_at(doc: &mut Document, path: &str) -> bool {
    match path.rsplit_once('.') {
        None => doc.remove(path).is_some(),
        Some((parent, leaf)) => {
            let mut target = doc;
            for segment in parent.split('.') {
                target = match target.get_mut(segment) {
                    Some(Bson::Document(inner)) => inner,
                    _ => return false,
                };
            }
            target.remove(leaf).is_some()
        }
    }
}
