//! Error types for the revision room stores

use thiserror::Error;

/// Failure kinds a store operation can report.
///
/// Handlers translate these into client-facing errors; nothing above the
/// store layer inspects database error strings.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} is no longer active")]
    Inactive(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message already liked")]
    AlreadyLiked,

    #[error("Message not liked")]
    NotLiked,

    #[error("Already voted on this poll")]
    AlreadyVoted,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record"),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
