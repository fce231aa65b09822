//! In-process `users` collection with the index semantics the repair relies on.
//!
//! Like the server, listing or dropping indexes fails with
//! [`StoreError::NamespaceNotFound`] until the collection has been created by
//! an insert or an index build.
//!
//! Clones share state, so a test can keep a handle after giving one to the
//! repair and inspect what happened, including whether it was released.

use bson::{oid::ObjectId, Document};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::modules::user::crud::{null_token_filter, StoreError, UserIndexStore};
use crate::modules::user::index::{matches_filter, IndexDescriptor};
use crate::modules::user::model::{remove_at, VERIFICATION_TOKEN_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListIndexes,
    DropIndex,
    CreateIndex,
    CountNullTokens,
    ClearNullTokens,
}

#[derive(Default)]
struct State {
    indexes: Vec<IndexDescriptor>,
    users: Vec<Document>,
    faults: VecDeque<(Operation, StoreError)>,
    calls: Vec<Operation>,
    collection_exists: bool,
    released: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryUsers {
    state: Arc<Mutex<State>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Installs an index without checking existing data, as an older
    /// deployment would have.
    pub fn with_index(self, index: IndexDescriptor) -> Self {
        {
            let mut state = self.lock();
            state.collection_exists = true;
            state.indexes.push(index);
        }
        self
    }

    /// Stores records without consulting any index.
    pub fn with_users(self, users: impl IntoIterator<Item = Document>) -> Self {
        {
            let mut state = self.lock();
            state.collection_exists = true;
            for mut user in users {
                ensure_id(&mut user);
                state.users.push(user);
            }
        }
        self
    }

    /// Makes the next call to `operation` fail with `error`.
    pub fn fail_next(&self, operation: Operation, error: StoreError) {
        self.lock().faults.push_back((operation, error));
    }

    /// Inserts a record, enforcing every unique index.
    pub fn insert(&self, mut user: Document) -> Result<ObjectId, StoreError> {
        let mut state = self.lock();

        for index in state.indexes.iter().filter(|index| index.unique) {
            let Some(key) = index.covers(&user) else {
                continue;
            };
            if state.users.iter().any(|existing| index.covers(existing).as_ref() == Some(&key)) {
                return Err(StoreError::DuplicateKey(format!(
                    "E11000 duplicate key error index: {} dup key: {:?}",
                    index.name, key
                )));
            }
        }

        let id = ensure_id(&mut user);
        state.collection_exists = true;
        state.users.push(user);
        Ok(id)
    }

    pub fn users(&self) -> Vec<Document> {
        self.lock().users.clone()
    }

    pub fn find(&self, id: &ObjectId) -> Option<Document> {
        self.lock()
            .users
            .iter()
            .find(|user| user.get_object_id("_id").ok() == Some(*id))
            .cloned()
    }

    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.lock().indexes.clone()
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Records the call and pops a queued fault for it, if any.
    fn enter(&self, operation: Operation) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        state.calls.push(operation);

        if let Some(position) = state.faults.iter().position(|(op, _)| *op == operation) {
            if let Some((_, error)) = state.faults.remove(position) {
                return Err(error);
            }
        }

        Ok(state)
    }
}

fn missing_collection() -> StoreError {
    StoreError::NamespaceNotFound("ns does not exist: users".to_string())
}

fn ensure_id(user: &mut Document) -> ObjectId {
    match user.get_object_id("_id") {
        Ok(id) => id,
        Err(_) => {
            let id = ObjectId::new();
            user.insert("_id", id);
            id
        }
    }
}

impl UserIndexStore for InMemoryUsers {
    async fn list_indexes(&self) -> Result<Vec<IndexDescriptor>, StoreError> {
        let state = self.enter(Operation::ListIndexes)?;
        if !state.collection_exists {
            return Err(missing_collection());
        }
        Ok(state.indexes.clone())
    }

    async fn drop_index(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.enter(Operation::DropIndex)?;
        if !state.collection_exists {
            return Err(missing_collection());
        }

        let Some(position) = state.indexes.iter().position(|index| index.name == name) else {
            return Err(StoreError::NotFound(format!("index not found with name [{name}]")));
        };
        state.indexes.remove(position);
        Ok(())
    }

    async fn create_index(&self, index: &IndexDescriptor) -> Result<String, StoreError> {
        let mut state = self.enter(Operation::CreateIndex)?;

        if let Some(existing) = state.indexes.iter().find(|existing| existing.name == index.name) {
            if existing.matches(index) {
                return Ok(existing.name.clone());
            }
            return Err(StoreError::IndexConflict(format!(
                "An existing index has the same name as the requested index: {}",
                index.name
            )));
        }

        if let Some(existing) = state.indexes.iter().find(|existing| existing.matches(index)) {
            return Err(StoreError::IndexConflict(format!(
                "Index already exists with a different name: {}",
                existing.name
            )));
        }

        if index.unique {
            let mut seen = Vec::new();
            for key in state.users.iter().filter_map(|user| index.covers(user)) {
                if seen.contains(&key) {
                    return Err(StoreError::DuplicateKey(format!(
                        "E11000 duplicate key error index: {} dup key: {:?}",
                        index.name, key
                    )));
                }
                seen.push(key);
            }
        }

        state.collection_exists = true;
        state.indexes.push(index.clone());
        Ok(index.name.clone())
    }

    async fn count_null_tokens(&self) -> Result<u64, StoreError> {
        let state = self.enter(Operation::CountNullTokens)?;
        let filter = null_token_filter();

        Ok(state
            .users
            .iter()
            .filter(|user| matches_filter(user, &filter))
            .count() as u64)
    }

    async fn clear_null_tokens(&self) -> Result<u64, StoreError> {
        let mut state = self.enter(Operation::ClearNullTokens)?;
        let filter = null_token_filter();

        let mut modified = 0;
        for user in state.users.iter_mut().filter(|user| matches_filter(user, &filter)) {
            if remove_at(user, VERIFICATION_TOKEN_PATH) {
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn release(self) {
        self.lock().released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::user::index::LEGACY_INDEX_NAME;
    use crate::modules::user::model::User;

    #[test]
    fn insert_enforces_legacy_index_on_nulls() {
        let users = InMemoryUsers::new().with_index(IndexDescriptor::legacy_token_index());

        users
            .insert(User::with_null_token("a@example.com").to_document().unwrap())
            .unwrap();
        let second = users.insert(User::with_null_token("b@example.com").to_document().unwrap());

        assert!(matches!(second, Err(StoreError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn queued_fault_fires_once() {
        let users = InMemoryUsers::new();
        users.fail_next(
            Operation::CountNullTokens,
            StoreError::Rejected {
                code: 13,
                message: "not authorized".into(),
            },
        );

        assert!(users.count_null_tokens().await.is_err());
        assert_eq!(users.count_null_tokens().await.unwrap(), 0);
        assert_eq!(users.calls(), vec![Operation::CountNullTokens, Operation::CountNullTokens]);
    }

    #[tokio::test]
    async fn missing_collection_rejects_index_listing_until_created() {
        let users = InMemoryUsers::new();

        let listed = users.list_indexes().await;
        let dropped = users.drop_index(LEGACY_INDEX_NAME).await;
        assert!(matches!(listed, Err(StoreError::NamespaceNotFound(_))));
        assert!(matches!(dropped, Err(StoreError::NamespaceNotFound(_))));

        users.create_index(&IndexDescriptor::token_index()).await.unwrap();
        assert_eq!(users.list_indexes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_index_rejects_existing_duplicates() {
        let users = InMemoryUsers::new().with_users([
            User::with_token("a@example.com", "abc").to_document().unwrap(),
            User::with_token("b@example.com", "abc").to_document().unwrap(),
        ]);

        let result = users.create_index(&IndexDescriptor::token_index()).await;

        assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
        assert!(users.indexes().is_empty());
    }
}
