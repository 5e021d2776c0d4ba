// Error types for the engine

use thiserror::Error;

use crate::datasource::DataSourceError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the scheduler, orchestrator, and manual service
#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] cutover_storage::StorageError),

    /// Bus failure
    #[error(transparent)]
    Bus(#[from] cutover_bus::BusError),

    /// Domain-level failure (offset grammar, template, CSV, spec)
    #[error(transparent)]
    Core(#[from] cutover_core::CoreError),

    /// Data-source adapter failure
    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Row the event referenced does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A manual operation's preconditions are not met; callers map this to a
    /// 4xx response
    #[error("{0}")]
    Precondition(String),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        EngineError::Precondition(msg.into())
    }
}
