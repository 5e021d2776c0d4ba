// Error types for core domain logic

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the pure domain layer
#[derive(Debug, Error)]
pub enum CoreError {
    /// Offset string did not match the T-relative grammar
    #[error("invalid offset {0:?}: expected T-0 or T-<n>s|m|h|d")]
    InvalidOffset(String),

    /// Duration string did not match the duration grammar
    #[error("invalid duration {0:?}: expected <n>s|m|h|d")]
    InvalidDuration(String),

    /// One or more `{{name}}` placeholders could not be resolved
    #[error("unresolved placeholders {names:?} in template {template:?}")]
    UnresolvedPlaceholders {
        template: String,
        names: Vec<String>,
    },

    /// Identifier failed the `^[A-Za-z0-9_]+$` safety check
    #[error("unsafe identifier {0:?}")]
    UnsafeIdentifier(String),

    /// Runbook specification document is invalid
    #[error("invalid runbook specification: {0}")]
    InvalidSpec(String),

    /// SELECT projection could not be parsed
    #[error("unparseable query projection: {0}")]
    InvalidProjection(String),

    /// CSV document failed validation
    #[error("invalid CSV: {0}")]
    CsvValidation(String),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create an invalid-spec error
    pub fn spec(msg: impl Into<String>) -> Self {
        CoreError::InvalidSpec(msg.into())
    }

    /// Create a CSV validation error
    pub fn csv(msg: impl Into<String>) -> Self {
        CoreError::CsvValidation(msg.into())
    }
}
