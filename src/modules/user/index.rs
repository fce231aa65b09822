//! Index definitions on the `users` collection and the matching rules used to
//! compare them and to decide which documents an index covers.

use bson::{doc, Bson, Document};
use mongodb::{options::IndexOptions, IndexModel};

use crate::modules::user::model::{field_at, TOKEN_PATH};

/// Unique index on the token without a filter. Rejects a second null token.
pub const LEGACY_INDEX_NAME: &str = "kyc.verificationToken.token_1";
pub const TOKEN_INDEX_NAME: &str = "kyc_verification_token_sparse";

/// Index metadata as reported by the database.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub key: Document,
    pub unique: bool,
    pub sparse: bool,
    pub partial_filter_expression: Option<Document>,
}

impl IndexDescriptor {
    /// The replacement index: unique over present, non-null tokens only.
    ///
    /// MongoDB accepts neither `$ne` in a partial filter nor `sparse` next to
    /// one, so the filter is `$exists` + `$type: "string"`, which excludes
    /// missing and null tokens and subsumes sparseness. Tokens stored as any
    /// other non-string type (numbers, sub-documents) are not covered either,
    /// so uniqueness holds only for string tokens.
    pub fn token_index() -> Self {
        Self {
            name: TOKEN_INDEX_NAME.to_string(),
            key: doc! { TOKEN_PATH: 1 },
            unique: true,
            sparse: true,
            partial_filter_expression: Some(doc! {
                TOKEN_PATH: { "$exists": true, "$type": "string" }
            }),
        }
    }

    /// The definition the portal originally shipped with.
    pub fn legacy_token_index() -> Self {
        Self {
            name: LEGACY_INDEX_NAME.to_string(),
            key: doc! { TOKEN_PATH: 1 },
            unique: true,
            sparse: false,
            partial_filter_expression: None,
        }
    }

    pub fn effectively_sparse(&self) -> bool {
        self.sparse || self.partial_filter_expression.is_some()
    }

    /// Same key, uniqueness, coverage and filter. The name is not compared.
    pub fn matches(&self, other: &IndexDescriptor) -> bool {
        keys_equivalent(&self.key, &other.key)
            && self.unique == other.unique
            && self.effectively_sparse() == other.effectively_sparse()
            && self.partial_filter_expression == other.partial_filter_expression
    }

    /// Returns the key tuple for `doc` when the index holds an entry for it.
    ///
    /// Missing key fields index as null unless the index is sparse and every
    /// key field is missing.
    pub fn covers(&self, doc: &Document) -> Option<Vec<Bson>> {
        if let Some(filter) = &self.partial_filter_expression {
            if !matches_filter(doc, filter) {
                return None;
            }
        }

        let values: Vec<Option<&Bson>> = self.key.keys().map(|path| field_at(doc, path)).collect();
        if self.sparse && values.iter().all(Option::is_none) {
            return None;
        }

        Some(
            values
                .into_iter()
                .map(|value| value.cloned().unwrap_or(Bson::Null))
                .collect(),
        )
    }

    pub fn to_index_model(&self) -> IndexModel {
        let sparse = (self.sparse && self.partial_filter_expression.is_none()).then_some(true);

        let options = IndexOptions::builder()
            .name(self.name.clone())
            .unique(self.unique)
            .sparse(sparse)
            .partial_filter_expression(self.partial_filter_expression.clone())
            .build();

        IndexModel::builder()
            .keys(self.key.clone())
            .options(options)
            .build()
    }
}

impl From<IndexModel> for IndexDescriptor {
    fn from(model: IndexModel) -> Self {
        let options = model.options.unwrap_or_default();
        Self {
            name: options.name.unwrap_or_default(),
            key: model.keys,
            unique: options.unique.unwrap_or(false),
            sparse: options.sparse.unwrap_or(false),
            partial_filter_expression: options.partial_filter_expression,
        }
    }
}

fn direction(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Key documents are equal field by field, in order. Numeric directions
/// compare by value since drivers disagree on int vs double.
fn keys_equivalent(left: &Document, right: &Document) -> bool {
    left.len() == right.len()
        && left.iter().zip(right.iter()).all(|((lf, lv), (rf, rv))| {
            lf == rf
                && match (direction(lv), direction(rv)) {
                    (Some(l), Some(r)) => l == r,
                    _ => lv == rv,
                }
        })
}

/// Evaluates the subset of query operators used by this crate's filters:
/// plain equality, `$eq`, `$ne`, `$exists` and `$type`.
///
/// Equality against null matches missing fields too, as the server does.
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, condition)| {
        let value = field_at(doc, path);
        match condition {
            Bson::Document(ops) if is_operator_document(ops) => {
                ops.iter().all(|(op, arg)| apply_operator(value, op, arg))
            }
            expected => value.unwrap_or(&Bson::Null) == expected,
        }
    })
}

fn is_operator_document(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|key| key.starts_with('$'))
}

fn apply_operator(value: Option<&Bson>, op: &str, arg: &Bson) -> bool {
    match op {
        "$eq" => value.unwrap_or(&Bson::Null) == arg,
        "$ne" => value.unwrap_or(&Bson::Null) != arg,
        "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
        "$type" => match (value, arg.as_str()) {
            (Some(value), Some(alias)) => type_matches(value, alias),
            _ => false,
        },
        _ => false,
    }
}

fn type_matches(value: &Bson, alias: &str) -> bool {
    match alias {
        "string" => matches!(value, Bson::String(_)),
        "null" => matches!(value, Bson::Null),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "bool" => matches!(value, Bson::Boolean(_)),
        "objectId" => matches!(value, Bson::ObjectId(_)),
        "date" => matches!(value, Bson::DateTime(_)),
        "int" => matches!(value, Bson::Int32(_)),
        "long" => matches!(value, Bson::Int64(_)),
        "double" => matches!(value, Bson::Double(_)),
        "number" => direction(value).is_some(),
        _ => false,
    }
}
