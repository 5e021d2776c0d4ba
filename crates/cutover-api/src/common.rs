// Shared API plumbing: error mapping and response envelopes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cutover_engine::EngineError;
use serde::Serialize;
use utoipa::ToSchema;

/// Error envelope returned by every non-2xx response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// API error: a status code plus a message body
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::Precondition(message) => ApiError::bad_request(message.clone()),
            EngineError::NotFound(message) => ApiError::not_found(message.clone()),
            EngineError::Core(core) => ApiError::bad_request(core.to_string()),
            _ => {
                tracing::error!("internal error: {e}");
                ApiError::internal("internal server error")
            }
        }
    }
}

impl From<cutover_storage::StorageError> for ApiError {
    fn from(e: cutover_storage::StorageError) -> Self {
        match &e {
            cutover_storage::StorageError::NotFound(message) => {
                ApiError::not_found(message.clone())
            }
            cutover_storage::StorageError::Conflict(message) => ApiError {
                status: StatusCode::CONFLICT,
                message: message.clone(),
            },
            _ => {
                tracing::error!("storage error: {e}");
                ApiError::internal("internal server error")
            }
        }
    }
}

impl From<cutover_core::CoreError> for ApiError {
    fn from(e: cutover_core::CoreError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}
