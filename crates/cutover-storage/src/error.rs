// Error type for storage operations

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the persistence layer
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique or state conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Identifier failed the safety check before SQL generation
    #[error(transparent)]
    Core(#[from] cutover_core::CoreError),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StorageError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        StorageError::Conflict(what.into())
    }
}
