//! Error taxonomy for external provider calls and the HTTP surface.
//!
//! `ProviderError` carries enough structure for the retry executor to decide
//! between transient (retry with backoff) and non-retryable (surface
//! immediately) failures. `ApiError` is the JSON envelope returned by
//! operational endpoints; it never serializes internal stacks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Transport status codes treated as transient by the retry executor.
pub const TRANSIENT_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider responded with an HTTP status outside the success range.
    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The requested model is unavailable; triggers the fallback-model path.
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// A long-running operation did not reach a terminal state in time.
    #[error("operation did not complete after {attempts} polls")]
    Timeout { attempts: u32 },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            ProviderError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the retry executor may retry this failure.
    ///
    /// Failures without a status code (transport resets, timeouts) are
    /// retried; a present, non-transient status is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self.status() {
            Some(status) => TRANSIENT_STATUS.contains(&status),
            None => !matches!(self, ProviderError::ModelNotFound { .. }),
        }
    }
}

/// JSON error envelope for operational endpoints.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "request failed");
        ApiError::internal(e.to_string())
    }
}
