//! Core Error Types
//!
//! Errors raised by format decoding, name validation, and generator
//! configuration. Higher-level crates wrap these in their own error enums.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The byte stream is not a well-formed DES container: bad magic, bad
    /// offsets, truncated regions, or an unsupported version.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// The container declares a format version newer than this reader
    /// understands. Consumers must refuse such containers.
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u16),

    /// A file name failed validation (empty, too long, NUL, traversal, or
    /// leading/trailing whitespace).
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Generator or hasher configuration is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}
