use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection, Database};
use thiserror::Error;

use crate::modules::user::index::IndexDescriptor;
use crate::modules::user::model::{COLLECTION_NAME, TOKEN_PATH, VERIFICATION_TOKEN_PATH};

const NAMESPACE_NOT_FOUND: i32 = 26;
const INDEX_NOT_FOUND: i32 = 27;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
const DUPLICATE_KEY: i32 = 11000;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("collection not found: {0}")]
    NamespaceNotFound(String),
    #[error("index not found: {0}")]
    NotFound(String),
    #[error("index conflict: {0}")]
    IndexConflict(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("command rejected ({code}): {message}")]
    Rejected { code: i32, message: String },
    #[error("database error: {0}")]
    Database(mongodb::error::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        let (code, message) = match *err.kind {
            ErrorKind::Command(ref command) => (command.code, command.message.clone()),
            ErrorKind::Write(WriteFailure::WriteError(ref write)) => {
                (write.code, write.message.clone())
            }
            _ => return StoreError::Database(err),
        };

        match code {
            NAMESPACE_NOT_FOUND => StoreError::NamespaceNotFound(message),
            INDEX_NOT_FOUND => StoreError::NotFound(message),
            INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT => StoreError::IndexConflict(message),
            DUPLICATE_KEY => StoreError::DuplicateKey(message),
            code => StoreError::Rejected { code, message },
        }
    }
}

/// Filter for tokens stored as an explicit null. `{ token: null }` would also
/// match records that lack the field.
pub fn null_token_filter() -> Document {
    doc! { TOKEN_PATH: { "$type": "null" } }
}

/// Index and cleanup operations the repair needs from the `users` collection.
#[allow(async_fn_in_trait)]
pub trait UserIndexStore {
    /// Fails with [`StoreError::NamespaceNotFound`] when the collection does
    /// not exist yet.
    async fn list_indexes(&self) -> Result<Vec<IndexDescriptor>, StoreError>;

    /// Fails with [`StoreError::NotFound`] when no index has that name, or
    /// [`StoreError::NamespaceNotFound`] when there is no collection.
    async fn drop_index(&self, name: &str) -> Result<(), StoreError>;

    /// Returns the name of the index the server reports as created.
    async fn create_index(&self, index: &IndexDescriptor) -> Result<String, StoreError>;

    async fn count_null_tokens(&self) -> Result<u64, StoreError>;

    /// Unsets `kyc.verificationToken` on every null-token record and returns
    /// how many records were modified.
    async fn clear_null_tokens(&self) -> Result<u64, StoreError>;

    /// Gives the connection back. Called once, on every exit path.
    async fn release(self);
}

pub struct UserCrud {
    client: Client,
    collection: Collection<Document>,
}

impl UserCrud {
    pub fn new(db: &Database) -> Self {
        Self {
            client: db.client().clone(),
            collection: db.collection(COLLECTION_NAME),
        }
    }
}

impl UserIndexStore for UserCrud {
    async fn list_indexes(&self) -> Result<Vec<IndexDescriptor>, StoreError> {
        let cursor = self.collection.list_indexes().await?;
        let models: Vec<_> = cursor.try_collect().await?;

        Ok(models.into_iter().map(IndexDescriptor::from).collect())
    }

    async fn drop_index(&self, name: &str) -> Result<(), StoreError> {
        self.collection.drop_index(name).await?;
        Ok(())
    }

    async fn create_index(&self, index: &IndexDescriptor) -> Result<String, StoreError> {
        let result = self.collection.create_index(index.to_index_model()).await?;
        Ok(result.index_name)
    }

    async fn count_null_tokens(&self) -> Result<u64, StoreError> {
        Ok(self.collection.count_documents(null_token_filter()).await?)
    }

    async fn clear_null_tokens(&self) -> Result<u64, StoreError> {
        let result = self
            .collection
            .update_many(
                null_token_filter(),
                doc! { "$unset": { VERIFICATION_TOKEN_PATH: "" } },
            )
            .await?;

        Ok(result.modified_count)
    }

    async fn release(self) {
        self.client.shutdown().await;
    }
}
