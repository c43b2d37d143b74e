//! Storage-specific error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem operation failed (shard directory creation, enumeration).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The collection knows no shards yet.
    #[error("no shards")]
    NoShards,

    /// A shard directory name does not decode under the configured time spec.
    #[error("cannot parse shard name '{name}': {reason}")]
    ShardName { name: String, reason: String },

    /// A result column carries a declared type outside TEXT/INTEGER/NUMERIC.
    #[error("unknown column type '{0}' in query result")]
    UnknownColumnType(String),

    /// Internal error (poisoned lock, thread join failure).
    #[error("internal error: {0}")]
    Internal(String),
}
