//! Packer Error Types
//!
//! One enum covering every failure the pipeline can hit. The retry module
//! classifies these into transient and permanent; `LeaseLost` is the one
//! internal signal — it triggers the LOST transition (abort writer, abandon
//! container, release lease) rather than a retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackerError>;

#[derive(Debug, Error)]
pub enum PackerError {
    #[error(transparent)]
    Storage(#[from] easystore_storage::Error),

    #[error(transparent)]
    Metadata(#[from] easystore_metadata::MetadataError),

    #[error(transparent)]
    Core(#[from] easystore_core::CoreError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("source database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lease lost for shard {shard_id}")]
    LeaseLost { shard_id: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}
