use bson::Document;
use kyc_index_repair::modules::user::crud::StoreError;
use kyc_index_repair::modules::user::index::{IndexDescriptor, LEGACY_INDEX_NAME, TOKEN_INDEX_NAME};
use kyc_index_repair::modules::user::memory::{InMemoryUsers, Operation};
use kyc_index_repair::modules::user::model::{field_at, TokenState, User, VERIFICATION_TOKEN_PATH};
use kyc_index_repair::services::index_repair::{
    drop_legacy_index, LegacyIndexOutcome, TokenIndexOutcome,
};
use kyc_index_repair::{repair, RepairError};
use tokio_test::{assert_err, assert_ok};

fn doc(user: User) -> Document {
    user.to_document().unwrap()
}

fn token_indexes(users: &InMemoryUsers) -> Vec<IndexDescriptor> {
    users
        .indexes()
        .into_iter()
        .filter(|index| index.name == TOKEN_INDEX_NAME)
        .collect()
}

#[tokio::test]
async fn test_drop_legacy_index_twice() {
    let users = InMemoryUsers::new().with_index(IndexDescriptor::legacy_token_index());

    let first = assert_ok!(drop_legacy_index(&users).await);
    let second = assert_ok!(drop_legacy_index(&users).await);

    assert_eq!(first, LegacyIndexOutcome::Dropped);
    assert_eq!(second, LegacyIndexOutcome::Absent);
    assert!(users.indexes().is_empty());
}

#[tokio::test]
async fn test_repair_is_idempotent() {
    let users = InMemoryUsers::new().with_index(IndexDescriptor::legacy_token_index());

    let first = assert_ok!(repair(users.clone()).await);
    let second = assert_ok!(repair(users.clone()).await);

    assert_eq!(first.legacy_index, LegacyIndexOutcome::Dropped);
    assert_eq!(first.token_index, TokenIndexOutcome::Created);
    assert_eq!(second.legacy_index, LegacyIndexOutcome::Absent);
    assert_eq!(second.token_index, TokenIndexOutcome::AlreadyPresent);
    assert_eq!(second.existing_indexes, vec![TOKEN_INDEX_NAME.to_string()]);

    let indexes = token_indexes(&users);
    assert_eq!(indexes.len(), 1);
    assert!(indexes[0].matches(&IndexDescriptor::token_index()));
    assert!(indexes[0].unique);
}

#[tokio::test]
async fn test_partial_filter_only_constrains_present_tokens() {
    let users = InMemoryUsers::new().with_users([
        doc(User::with_token("a@example.com", "abc")),
        doc(User::without_token("b@example.com")),
    ]);
    assert_ok!(repair(users.clone()).await);

    for i in 0..3 {
        assert_ok!(users.insert(doc(User::with_null_token(&format!("null{i}@example.com")))));
        assert_ok!(users.insert(doc(User::without_token(&format!("none{i}@example.com")))));
    }
    assert_ok!(users.insert(doc(User::with_token("c@example.com", "def"))));

    let duplicate = assert_err!(users.insert(doc(User::with_token("d@example.com", "abc"))));
    assert!(matches!(duplicate, StoreError::DuplicateKey(_)));
}

#[tokio::test]
async fn test_single_null_token_is_not_modified() {
    let users = InMemoryUsers::new().with_users([
        doc(User::with_null_token("a@example.com")),
        doc(User::with_token("b@example.com", "abc")),
    ]);

    let report = assert_ok!(repair(users.clone()).await);

    assert_eq!(report.null_tokens_found, 1);
    assert_eq!(report.null_tokens_cleared, 0);
    assert!(!users.calls().contains(&Operation::ClearNullTokens));
    let nulls = users
        .users()
        .iter()
        .filter(|user| TokenState::of(user) == TokenState::Null)
        .count();
    assert_eq!(nulls, 1);
}

#[tokio::test]
async fn test_three_null_tokens_are_cleared() {
    let users = InMemoryUsers::new().with_users([
        doc(User::with_null_token("a@example.com")),
        doc(User::with_null_token("b@example.com")),
        doc(User::with_null_token("c@example.com")),
        doc(User::without_token("d@example.com")),
    ]);

    let report = assert_ok!(repair(users.clone()).await);

    assert_eq!(report.null_tokens_found, 3);
    assert_eq!(report.null_tokens_cleared, 3);
    for user in users.users() {
        assert!(field_at(&user, VERIFICATION_TOKEN_PATH).is_none());
        assert!(field_at(&user, "kyc.status").is_some());
    }
}

#[tokio::test]
async fn test_unexpected_drop_failure_aborts_and_releases() {
    let users = InMemoryUsers::new().with_index(IndexDescriptor::legacy_token_index());
    users.fail_next(
        Operation::DropIndex,
        StoreError::Rejected {
            code: 13,
            message: "not authorized on kyc-portal to execute command".to_string(),
        },
    );

    let err = assert_err!(repair(users.clone()).await);

    assert!(matches!(
        err,
        RepairError::Store(StoreError::Rejected { code: 13, .. })
    ));
    assert_eq!(users.calls(), vec![Operation::ListIndexes, Operation::DropIndex]);
    assert!(users.is_released());
    assert_eq!(users.indexes(), vec![IndexDescriptor::legacy_token_index()]);
}

#[tokio::test]
async fn test_create_failure_leaves_legacy_index_dropped() {
    let users = InMemoryUsers::new()
        .with_index(IndexDescriptor::legacy_token_index())
        .with_users([
            doc(User::with_token("a@example.com", "abc")),
            doc(User::with_token("b@example.com", "abc")),
        ]);

    let err = assert_err!(repair(users.clone()).await);

    assert!(matches!(err, RepairError::Store(StoreError::DuplicateKey(_))));
    assert!(users.indexes().is_empty());
    assert!(!users.calls().contains(&Operation::CountNullTokens));
    assert!(users.is_released());
}

#[tokio::test]
async fn test_successful_run_releases_store() {
    let users = InMemoryUsers::new();

    assert_ok!(repair(users.clone()).await);

    assert!(users.is_released());
    assert_eq!(
        users.calls(),
        vec![
            Operation::ListIndexes,
            Operation::DropIndex,
            Operation::CreateIndex,
            Operation::CountNullTokens,
        ]
    );
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let users = InMemoryUsers::new()
        .with_index(IndexDescriptor::legacy_token_index())
        .with_users([
            doc(User::with_null_token("a@example.com")),
            doc(User::with_null_token("b@example.com")),
        ]);
    let abc_id = assert_ok!(users.insert(doc(User::with_token("c@example.com", "abc"))));
    let abc_before = users.find(&abc_id).unwrap();

    let report = assert_ok!(repair(users.clone()).await);

    assert_eq!(report.existing_indexes, vec![LEGACY_INDEX_NAME.to_string()]);
    assert_eq!(report.legacy_index, LegacyIndexOutcome::Dropped);
    assert_eq!(report.token_index, TokenIndexOutcome::Created);
    assert_eq!(report.null_tokens_found, 2);

    let names: Vec<String> = users.indexes().into_iter().map(|index| index.name).collect();
    assert_eq!(names, vec![TOKEN_INDEX_NAME.to_string()]);

    for user in users.users() {
        if user.get_object_id("_id").unwrap() == abc_id {
            assert_eq!(user, abc_before);
        } else {
            assert_eq!(TokenState::of(&user), TokenState::Absent);
            assert!(field_at(&user, VERIFICATION_TOKEN_PATH).is_none());
        }
    }

    let duplicate = assert_err!(users.insert(doc(User::with_token("d@example.com", "abc"))));
    assert!(matches!(duplicate, StoreError::DuplicateKey(_)));
}

#[tokio::test]
async fn test_missing_collection_is_created_on_first_run() {
    let users = InMemoryUsers::new();

    let first = assert_ok!(repair(users.clone()).await);
    let second = assert_ok!(repair(users.clone()).await);

    assert!(first.existing_indexes.is_empty());
    assert_eq!(first.legacy_index, LegacyIndexOutcome::Absent);
    assert_eq!(first.token_index, TokenIndexOutcome::Created);
    assert_eq!(second.existing_indexes, vec![TOKEN_INDEX_NAME.to_string()]);
    assert_eq!(second.token_index, TokenIndexOutcome::AlreadyPresent);
    assert_eq!(token_indexes(&users).len(), 1);
}
