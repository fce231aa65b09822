use mongodb::{bson::doc, options::ClientOptions, Client, Database};
use std::env;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

pub const DEFAULT_URI: &str = "mongodb://localhost:27017/kyc-portal";
pub const DEFAULT_DATABASE: &str = "kyc-portal";

/// Connection settings for the database holding the `users` collection.
#[derive(Debug, Clone, Validate)]
pub struct DatabaseConfig {
    #[validate(
        length(min = 1, message = "MONGODB_URI cannot be empty"),
        custom(function = "validate_scheme")
    )]
    pub uri: String,
    #[validate(length(min = 1, message = "MONGODB_DATABASE cannot be empty"))]
    pub database: Option<String>,
}

fn validate_scheme(uri: &str) -> Result<(), ValidationError> {
    if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
        return Ok(());
    }

    let mut error = ValidationError::new("scheme");
    error.message = Some("MONGODB_URI must start with mongodb:// or mongodb+srv://".into());
    Err(error)
}

impl DatabaseConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Reads `MONGODB_URI` and `MONGODB_DATABASE`, falling back to a local instance.
    pub fn from_env() -> Self {
        let uri = env::var("MONGODB_URI").unwrap_or_else(|_| DEFAULT_URI.to_string());
        let database = env::var("MONGODB_DATABASE").ok();

        Self { uri, database }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URI)
    }
}

/// Opens a client, checks the server answers `ping` and selects the database.
///
/// The database is `config.database` when set, otherwise the one named in the
/// URI path, otherwise [`DEFAULT_DATABASE`].
pub async fn connect(config: &DatabaseConfig) -> Result<Database, mongodb::error::Error> {
    let options = ClientOptions::parse(&config.uri).await?;
    let db_name = config
        .database
        .clone()
        .or_else(|| options.default_database.clone())
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

    let client = Client::with_options(options)?;

    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await?;
    debug!("ping acknowledged");

    info!(database = %db_name, "connected to MongoDB");
    Ok(client.database(&db_name))
}
