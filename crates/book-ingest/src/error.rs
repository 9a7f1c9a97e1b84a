//! Error types for the ingestion pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Longest diagnostic persisted on a job row
const MAX_SUMMARY_LEN: usize = 300;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bad upload input, never reaches a job
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Precheck could not open or measure the PDF
    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    /// Parsing engine failed, timed out or returned malformed output
    #[error("Parsing engine error: {0}")]
    Engine(String),

    /// Filesystem or database write failure during ingestion
    #[error("Storage error: {0}")]
    Storage(String),

    /// Explicit cancel request observed at a checkpoint
    #[error("Cancelled by user")]
    UserCancelled,

    /// The worker no longer holds the book lease
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with the current job or book state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persisted data breaks a reader-facing invariant
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Image decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a corrupt document error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptDocument(message.into())
    }

    /// Create an engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable taxonomy name recorded as the job's error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::CorruptDocument(_) => "CorruptDocumentError",
            Error::Engine(_) => "EngineError",
            Error::Storage(_) | Error::Io(_) | Error::Database(_) | Error::Image(_) => {
                "StorageError"
            }
            Error::UserCancelled => "UserCancelled",
            Error::LeaseLost(_) => "LeaseLost",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::ContractViolation(_) => "ContractViolation",
            Error::Config(_) => "ConfigError",
            Error::Json(_) | Error::Internal(_) => "InternalError",
        }
    }

    /// Reclassify low-level IO/database failures as storage errors.
    ///
    /// Pipeline-level kinds (engine, cancellation, ...) pass through untouched.
    pub fn into_storage(self) -> Self {
        match self {
            Error::Io(e) => Error::Storage(e.to_string()),
            Error::Database(e) => Error::Storage(e.to_string()),
            Error::Image(e) => Error::Storage(e.to_string()),
            Error::Internal(msg) => Error::Storage(msg),
            other => other,
        }
    }

    /// Concise diagnostic for the job row: `"<kind>: <message>"`, bounded in length
    pub fn summary(&self) -> String {
        let detail = match self {
            Error::Validation(m)
            | Error::CorruptDocument(m)
            | Error::Engine(m)
            | Error::Storage(m)
            | Error::LeaseLost(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::ContractViolation(m)
            | Error::Config(m)
            | Error::Internal(m) => m.clone(),
            Error::UserCancelled => "cancelled by user".to_string(),
            other => other.to_string(),
        };
        // Only the first line; multi-line tool output stays in the logs
        let first_line = detail.lines().next().unwrap_or("").trim();
        truncate(&format!("{}: {}", self.kind(), first_line), MAX_SUMMARY_LEN)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CorruptDocument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Engine(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Truncate on a char boundary, appending an ellipsis when shortened
pub(crate) fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_is_prefixed_with_kind() {
        let err = Error::engine("exit status 3");
        assert_eq!(err.summary(), "EngineError: exit status 3");

        let err = Error::UserCancelled;
        assert_eq!(err.summary(), "UserCancelled: cancelled by user");
    }

    #[test]
    fn test_summary_is_bounded_and_single_line() {
        let long = format!("first line {}\nsecond line", "x".repeat(1000));
        let summary = Error::engine(long).summary();
        assert!(summary.len() <= MAX_SUMMARY_LEN);
        assert!(summary.ends_with("..."));
        assert!(!summary.contains("second line"));
    }

    #[test]
    fn test_io_errors_classify_as_storage() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(err.kind(), "StorageError");
        assert!(matches!(err.into_storage(), Error::Storage(_)));
        assert!(matches!(Error::UserCancelled.into_storage(), Error::UserCancelled));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ééééé";
        let out = truncate(text, 6);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 6);
    }
}
