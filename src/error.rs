//! Error types shared across the dump/restore core

use thiserror::Error;

/// Result type alias for dump/restore operations
pub type Result<T> = std::result::Result<T, DumpError>;

/// Errors surfaced by the fetch, load and chunked-store subsystems.
///
/// The first error observed by any worker is latched; later failures are
/// suppressed so `run()`-style entry points report a single terminal error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DumpError {
    /// Invalid construction-time parameter (part size, parallelism, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Table read or write failed after the transport exhausted its retries
    #[error("table operation failed: {0}")]
    Table(String),

    /// A conditional put collided with an existing item. Expected under
    /// overwrite protection; the loader tallies it instead of failing.
    #[error("conditional write collided with an existing item")]
    ConditionalCheckFailed,

    /// Object store put/get/list/delete failed
    #[error("object store error: {0}")]
    Storage(String),

    /// Requested object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Local I/O failure (temp part files, pipes)
    #[error("I/O error: {0}")]
    Io(String),

    /// Item could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// A part's stored hash does not match its uncompressed content
    #[error("part {key} hash mismatch expected={expected} actual={actual}")]
    PartHashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// The dump-wide hash of part hashes does not match the descriptor
    #[error("corrupt dump; expected final hash of {expected}, got {actual}")]
    AggregateHashMismatch { expected: String, actual: String },

    /// Fewer parts were observed than the descriptor declares
    #[error("incomplete dump; expected {expected} parts, found {found}")]
    IncompleteDump { expected: i64, found: i64 },

    /// The operation was aborted by the caller
    #[error("aborted")]
    Aborted,
}

impl DumpError {
    /// True for integrity violations detected while reading a dump back.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            DumpError::PartHashMismatch { .. }
                | DumpError::AggregateHashMismatch { .. }
                | DumpError::IncompleteDump { .. }
        )
    }

    /// True when the error indicates a missing object rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DumpError::NotFound(_))
    }

    /// True when the caller requested the stop rather than something breaking.
    pub fn is_aborted(&self) -> bool {
        matches!(self, DumpError::Aborted)
    }
}

impl From<std::io::Error> for DumpError {
    fn from(err: std::io::Error) -> Self {
        DumpError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DumpError {
    fn from(err: serde_json::Error) -> Self {
        DumpError::Codec(err.to_string())
    }
}
