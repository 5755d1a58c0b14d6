//! Metadata Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("invalid stored value: {0}")]
    InvalidRow(String),
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::Migration(e.to_string())
    }
}

impl MetadataError {
    /// Transient failures (connection loss, pool exhaustion, serialization
    /// conflicts, deadlocks) are worth retrying with backoff; everything
    /// else should surface.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    // 40001: serialization_failure, 40P01: deadlock_detected
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}
