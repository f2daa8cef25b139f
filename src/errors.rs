use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failure of a single notification or request, classified so callers can
/// tell retryable backend trouble from terminal input problems.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Missing or malformed request fields. Never retried.
    #[error("{0}")]
    Validation(String),

    /// The object was absent when the backend was asked for it.
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },

    /// A store or source call failed (or timed out).
    #[error("{operation} failed: {message}")]
    Backend {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// The request carries neither a notification batch nor retrieval parameters.
    #[error("Unsupported event source.")]
    UnsupportedRequest,
}

impl ProcessError {
    pub fn backend(operation: &str, message: impl fmt::Display, retryable: bool) -> Self {
        Self::Backend {
            operation: operation.to_string(),
            message: message.to_string(),
            retryable,
        }
    }

    /// Stable machine-readable name used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Backend { .. } => "backend",
            Self::UnsupportedRequest => "unsupported_request",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { retryable: true, .. })
    }

    /// HTTP-style status code for this error when it ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::UnsupportedRequest => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } | Self::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_unsupported_map_to_bad_request() {
        assert_eq!(
            ProcessError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProcessError::UnsupportedRequest.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn only_flagged_backend_errors_are_retryable() {
        assert!(ProcessError::backend("upsert", "locked", true).is_retryable());
        assert!(!ProcessError::backend("upsert", "constraint", false).is_retryable());
        assert!(!ProcessError::Validation("bad".into()).is_retryable());
        assert!(
            !ProcessError::NotFound {
                bucket: "b".into(),
                key: "k".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn backend_error_message_names_operation() {
        let err = ProcessError::backend("delete", "disk I/O error", true);
        assert_eq!(err.to_string(), "delete failed: disk I/O error");
        assert_eq!(err.kind(), "backend");
    }
}
