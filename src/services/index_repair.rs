use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::database::{self, DatabaseConfig};
use crate::modules::user::crud::{StoreError, UserCrud, UserIndexStore};
use crate::modules::user::index::{IndexDescriptor, LEGACY_INDEX_NAME};

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("invalid configuration: {0}")]
    Config(#[from] validator::ValidationErrors),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyIndexOutcome {
    Dropped,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenIndexOutcome {
    Created,
    AlreadyPresent,
}

/// What a completed run did to the `users` collection.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub run_id: Uuid,
    pub existing_indexes: Vec<String>,
    pub legacy_index: LegacyIndexOutcome,
    pub token_index: TokenIndexOutcome,
    pub null_tokens_found: u64,
    pub null_tokens_cleared: u64,
    pub completed_at: DateTime<Utc>,
}

/// Connects with `config` and repairs the KYC verification token index.
pub async fn fix_kyc_token_index(config: &DatabaseConfig) -> Result<RepairReport, RepairError> {
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid database configuration");
        return Err(e.into());
    }

    let db = database::connect(config).await.map_err(|e| {
        error!(error = %e, "failed to connect to MongoDB");
        StoreError::from(e)
    })?;

    repair(UserCrud::new(&db)).await
}

/// Runs the repair against `store` and releases it afterwards, whether or
/// not a step failed. Completed steps are not rolled back.
pub async fn repair<S: UserIndexStore>(store: S) -> Result<RepairReport, RepairError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("fix_kyc_token_index", %run_id);

    let result = run_steps(&store, run_id).instrument(span.clone()).await;
    if let Err(e) = &result {
        span.in_scope(|| error!(error = ?e, "error fixing index"));
    }

    store.release().instrument(span).await;
    result
}

async fn run_steps<S: UserIndexStore>(
    store: &S,
    run_id: Uuid,
) -> Result<RepairReport, RepairError> {
    info!("starting index fix");

    let existing = match store.list_indexes().await {
        Ok(existing) => existing,
        Err(StoreError::NamespaceNotFound(_)) => {
            warn!("users collection does not exist yet");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    let existing_indexes: Vec<String> = existing.iter().map(|index| index.name.clone()).collect();
    info!(indexes = ?existing_indexes, "existing indexes");

    let legacy_index = drop_legacy_index(store).await?;
    let token_index = ensure_token_index(store, &existing).await?;
    let (null_tokens_found, null_tokens_cleared) = clear_duplicate_null_tokens(store).await?;

    info!("index fix completed successfully");

    Ok(RepairReport {
        run_id,
        existing_indexes,
        legacy_index,
        token_index,
        null_tokens_found,
        null_tokens_cleared,
        completed_at: Utc::now(),
    })
}

/// Drops the legacy index. A missing index or a missing collection counts as
/// already dropped.
pub async fn drop_legacy_index<S: UserIndexStore>(
    store: &S,
) -> Result<LegacyIndexOutcome, StoreError> {
    match store.drop_index(LEGACY_INDEX_NAME).await {
        Ok(()) => {
            info!(index = LEGACY_INDEX_NAME, "dropped problematic index");
            Ok(LegacyIndexOutcome::Dropped)
        }
        Err(StoreError::NotFound(_) | StoreError::NamespaceNotFound(_)) => {
            warn!(index = LEGACY_INDEX_NAME, "index already doesn't exist, continuing");
            Ok(LegacyIndexOutcome::Absent)
        }
        Err(e) => Err(e),
    }
}

/// Creates the partial unique token index unless an identical one is listed
/// in `existing`. A same-named index with other options is a conflict.
pub async fn ensure_token_index<S: UserIndexStore>(
    store: &S,
    existing: &[IndexDescriptor],
) -> Result<TokenIndexOutcome, StoreError> {
    let desired = IndexDescriptor::token_index();

    match existing.iter().find(|index| index.name == desired.name) {
        Some(current) if current.matches(&desired) => {
            info!(index = %desired.name, "token index already present");
            Ok(TokenIndexOutcome::AlreadyPresent)
        }
        Some(current) => Err(StoreError::IndexConflict(format!(
            "index {} exists with a different definition: {:?}",
            current.name, current
        ))),
        None => {
            let name = store.create_index(&desired).await?;
            info!(index = %name, "created new sparse index for KYC verification tokens");
            Ok(TokenIndexOutcome::Created)
        }
    }
}

/// Strips `kyc.verificationToken` from null-token records when more than one
/// exists. Returns the count found and the count modified.
pub async fn clear_duplicate_null_tokens<S: UserIndexStore>(
    store: &S,
) -> Result<(u64, u64), StoreError> {
    let found = store.count_null_tokens().await?;
    if found <= 1 {
        info!(count = found, "no duplicate null tokens");
        return Ok((found, 0));
    }

    info!(count = found, "found documents with null tokens");
    let cleared = store.clear_null_tokens().await?;
    info!(count = cleared, "cleaned up null token documents");

    Ok((found, cleared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::user::memory::{InMemoryUsers, Operation};
    use crate::modules::user::model::User;

    #[tokio::test]
    async fn divergent_index_with_same_name_is_a_conflict() {
        let divergent = IndexDescriptor {
            unique: false,
            ..IndexDescriptor::token_index()
        };
        let users = InMemoryUsers::new().with_index(divergent.clone());

        let result = ensure_token_index(&users, &[divergent]).await;

        assert!(matches!(result, Err(StoreError::IndexConflict(_))));
        assert!(!users.calls().contains(&Operation::CreateIndex));
    }

    #[tokio::test]
    async fn single_null_token_is_left_alone() {
        let users = InMemoryUsers::new()
            .with_users([User::with_null_token("a@example.com").to_document().unwrap()]);

        let (found, cleared) = clear_duplicate_null_tokens(&users).await.unwrap();

        assert_eq!((found, cleared), (1, 0));
        assert!(!users.calls().contains(&Operation::ClearNullTokens));
    }

    #[test]
    fn report_serializes_outcomes_in_snake_case() {
        let report = RepairReport {
            run_id: Uuid::nil(),
            existing_indexes: vec!["_id_".to_string()],
            legacy_index: LegacyIndexOutcome::Absent,
            token_index: TokenIndexOutcome::AlreadyPresent,
            null_tokens_found: 0,
            null_tokens_cleared: 0,
            completed_at: Utc::now(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["legacy_index"], "absent");
        assert_eq!(json["token_index"], "already_present");
    }
}
