//! # Error Handling
//!
//! Errors returned by the admin HTTP API and how they become responses.
//!
//! The media core has its own error type ([`StreamError`]); this module only
//! decides what an API client sees when a core operation fails.
//!
//! ## JSON Response Format:
//! Every error response has the same shape:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "No live stream with id MZ123",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## Rust Concepts Used:
//! - **From trait**: lets handlers use `?` on config, JSON and stream errors
//! - **ResponseError trait**: actix-web calls `error_response` for us

use crate::media::StreamError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced by the admin API.
///
/// ## Error Categories:
/// - **Internal** / **ConfigError**: our problem (500)
/// - **BadRequest** / **ValidationError**: the client's problem (400)
/// - **NotFound**: no such stream (404)
/// - **StreamClosed**: the stream ended before the operation ran (409)
/// - **StreamFailed**: the socket write towards the caller failed (502)
/// - **Unavailable**: the media layer is shutting down (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    StreamClosed(String),
    StreamFailed(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::StreamClosed(msg) => write!(f, "Stream closed: {}", msg),
            AppError::StreamFailed(msg) => write!(f, "Stream failed: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::StreamClosed(msg) => (StatusCode::CONFLICT, "stream_closed", msg),
            AppError::StreamFailed(msg) => (StatusCode::BAD_GATEWAY, "stream_failed", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed request bodies are the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Closed => AppError::StreamClosed(err.to_string()),
            StreamError::ProviderClosed => AppError::Unavailable(err.to_string()),
            other => AppError::StreamFailed(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
