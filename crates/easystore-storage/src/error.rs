//! Storage Error Types
//!
//! Errors raised by the container writer and both readers.
//!
//! ## Error categories
//!
//! - **Corruption**: `Core(CorruptContainer | UnsupportedVersion)` — the
//!   stream is not a well-formed DES container. Fatal for that read; never
//!   cached.
//! - **Caller errors**: `NameConflict`, `InvalidMeta`, `WriterClosed` — the
//!   `add` call was wrong, the writer state is untouched.
//! - **Lookup failures**: `NotFound` names both the container and the file,
//!   and is not fatal to the handle.
//! - **I/O**: `Io`, `ObjectStore`, `RangeRead`, `ExternalFetch` — the
//!   underlying byte transport failed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] easystore_core::CoreError),

    #[error("file {name:?} not found in container {container}")]
    NotFound { container: String, name: String },

    #[error("file {name:?} already added to this container")]
    NameConflict { name: String },

    #[error("invalid metadata: {0}")]
    InvalidMeta(String),

    #[error("writer is already finalized or aborted")]
    WriterClosed,

    #[error("external storage is not configured for this handle")]
    ExternalNotConfigured,

    #[error("failed to fetch external file {key}: {source}")]
    ExternalFetch {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("range read failed for container {container}: {detail}")]
    RangeRead { container: String, detail: String },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the container itself is malformed.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Error::Core(
                easystore_core::CoreError::CorruptContainer(_)
                    | easystore_core::CoreError::UnsupportedVersion(_)
            )
        )
    }
}
