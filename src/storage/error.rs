//! Storage error types
//!
//! Defines all errors that can occur in the storage core.

use thiserror::Error;

/// Errors that can occur in the storage core
#[derive(Error, Debug)]
pub enum StorageError {
    /// Root inaccessible, locked by another handle, or corrupt layout at open
    #[error("Open failed for {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// A write payload does not match the schema it claims
    #[error("Element is malformed: {0}")]
    MalformedElement(String),

    /// Truncated or invalid encoded bytes (checksum mismatch, bad magic, etc.)
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Requested shard id is out of range
    #[error("Shard {shard_id} unavailable (shard count {shard_num})")]
    ShardUnavailable { shard_id: u32, shard_num: u32 },

    /// Schema cannot be turned into a locator
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Invalid time range (start >= end)
    #[error("Invalid time range: start must be less than end")]
    InvalidTimeRange,

    /// Write into a time window that retention already dropped
    #[error("Timestamp {0} is older than the retention horizon")]
    Expired(i64),

    /// Invalid database options
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation's context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation's context deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The database or shard was already closed
    #[error("Storage closed")]
    Closed,

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Index writer reported a failure
    #[error("Index error: {0}")]
    Index(String),

    /// Several independent operations failed (e.g. closing many shards)
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<StorageError>),
}

fn join_errors(errors: &[StorageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    /// Wrap an error raised while opening a database root
    pub fn open_failed(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        StorageError::OpenFailed {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Collapse a list of errors: none is Ok, one is itself, more become `Multiple`
    pub fn aggregate(mut errors: Vec<StorageError>) -> StorageResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StorageError::Multiple(errors)),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
