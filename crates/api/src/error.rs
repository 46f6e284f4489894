//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use revroom_shared::StoreError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} is no longer active")]
    Inactive(&'static str),
    #[error("{0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code for the envelope
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Inactive(_) => "INACTIVE",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_)
            | ApiError::InvalidArgument(_)
            | ApiError::Inactive(_)
            | ApiError::Conflict(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text sent to a real-time client in an `error` event
    pub fn client_message(&self) -> String {
        match self {
            ApiError::Internal => "Operation failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": self.code(),
            "message": message,
        }));

        (self.status(), body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::InvalidArgument(msg) => ApiError::InvalidArgument(msg),
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Forbidden(msg) => ApiError::Forbidden(msg),
            StoreError::Inactive(what) => ApiError::Inactive(what),
            StoreError::AlreadyLiked | StoreError::NotLiked | StoreError::AlreadyVoted => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::Database(detail) => {
                tracing::error!(error = %detail, "Store operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
