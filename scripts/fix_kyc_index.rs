//! Run with: cargo run --bin fix-kyc-index
//!
//! Replaces the unique `kyc.verificationToken.token_1` index on `users` with a
//! partial unique index that ignores missing and null tokens. Safe to re-run.

use std::process::ExitCode;

use kyc_index_repair::config::database::DatabaseConfig;
use kyc_index_repair::fix_kyc_token_index;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DatabaseConfig::from_env();

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("index fix failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &DatabaseConfig) -> anyhow::Result<()> {
    let report = fix_kyc_token_index(config).await?;
    info!(report = %serde_json::to_string(&report)?, "repair report");
    Ok(())
}
