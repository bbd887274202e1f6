//! Centralized error types for the MediaViewer core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the MediaViewer server.
///
/// The variants mirror the error kinds the core recognizes: validation
/// failures surface as 4xx, not-found as 404, a conflicting scan as 409,
/// transient external-tool failures degrade gracefully and never reach
/// here as fatal, transport failures only ever kill one connection, and
/// fatal configuration errors prevent startup entirely.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum MediaViewerError {
    /// Malformed or out-of-range client input (missing `clientId`, empty
    /// `mediaId`, malformed JSON, out-of-range `Range` header).
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Referenced resource does not exist (unknown media id, missing
    /// sidecar, file vanished from disk).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conflicting operation is already running (scan already in progress).
    #[error("Busy: {0}")]
    Busy(String),

    /// A transient external dependency failed (`ffprobe`/`ffmpeg` non-zero
    /// exit, unreadable sidecar). Callers are expected to degrade
    /// gracefully rather than propagate this as fatal.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A socket or stream write failed; only the affected connection is
    /// torn down, other connections are unaffected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration invalid at startup (e.g. missing `MEDIA_ROOT`); the
    /// process must refuse to start.
    #[error("Fatal configuration error: {0}")]
    Fatal(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorCode for MediaViewerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Busy(_) => "busy",
            Self::Transient(_) => "transient_error",
            Self::Transport(_) => "transport_error",
            Self::Fatal(_) => "fatal_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl MediaViewerError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        ErrorCode::code(self)
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Fatal(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type MediaViewerResult<T> = Result<T, MediaViewerError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for MediaViewerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for MediaViewerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_returns_correct_code() {
        let err = MediaViewerError::NotFound("media item m1".into());
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn busy_returns_409() {
        let err = MediaViewerError::Busy("scan already running".into());
        assert_eq!(err.code(), "busy");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_returns_400() {
        let err = MediaViewerError::Validation("clientId missing".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn fatal_returns_500() {
        let err = MediaViewerError::Fatal("MEDIA_ROOT not set".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
