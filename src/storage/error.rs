use crate::sqlite_persistence::SchemaError;
use thiserror::Error;

/// Failure of the persistence layer. Lease conflicts are not errors; the
/// stores report them as `false`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Unsupported schema version {0}")]
    UnsupportedVersion(u32),

    #[error("Storage lock poisoned")]
    Poisoned,
}
