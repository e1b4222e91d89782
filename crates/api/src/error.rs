//! Startup errors.

use thiserror::Error;

/// Failures while wiring the registry to its databases.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not connect to the directory database: {0}")]
    Directory(#[source] sqlx::Error),

    #[error("directory migrations failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid tenant database URL: {0}")]
    TenantUrl(#[source] sqlx::Error),
}
