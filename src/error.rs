//! # Error Handling
//!
//! Two error types live here:
//!
//! - **`AppError`**: what an HTTP handler returns. It implements actix's
//!   `ResponseError` so a handler can use `?` and the client still gets a
//!   consistent JSON body.
//! - **`PipelineError`**: the failure taxonomy of the voice pipeline. Every
//!   adapter (download, STT, agent, TTS, delivery) reports one of these kinds,
//!   and the retry wrapper and orchestrator decide what to do from the kind
//!   alone.
//!
//! ## Recovery per kind:
//! - `Transport`: retried with backoff up to the stage's bound
//! - `AuthFailure`: one token refresh inside the agent client, then fatal
//! - `SessionInvalid`: the session is re-created and the whole turn retried once
//! - `UnsupportedFormat` / `TranscodeFailed`: the transcoder is bypassed once
//! - `EmptyReply`: replaced by a configured fallback phrase
//! - `Backend`: retried with backoff up to the stage's bound
//! - `Rejected` / `Config`: fatal immediately
//!
//! "No speech detected" is deliberately absent: an empty transcript is a
//! successful `TranscriptionResult`, not an error.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the caller sent something we cannot parse (400)
/// - **NotFound**: e.g. an expired audio key (404)
/// - **ConfigError**: configuration problems (500)
/// - **Overloaded**: no turn slot became free in time (503)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Service overloaded: {0}")]
    Overloaded(String),
}

/// JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "audio 'ab12…' is not cached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Overloaded(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "overloaded",
                msg.clone(),
            ),
        };

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

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Failure kinds reported by pipeline stages.
///
/// Each variant carries a human-readable detail for logs. The detail is never
/// sent to the end user; the orchestrator maps every fatal kind to one of the
/// configured fallback phrases.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Network failure or stage timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential or bearer token rejected
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Backend does not know (or no longer knows) the session
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// STT backend refused the audio encoding
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Local audio conversion failed
    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    /// Agent answered successfully but with no message content
    #[error("agent returned an empty reply")]
    EmptyReply,

    /// Upstream 5xx / 429 or an explicit failure message
    #[error("backend error: {0}")]
    Backend(String),

    /// Upstream rejected the request in a way a retry cannot fix
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the uniform retry wrapper may try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transport(_) | PipelineError::Backend(_))
    }

    /// Short machine-readable label, used as a structured log field and as
    /// the key of the failure counters on the metrics surface.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transport(_) => "transport",
            PipelineError::AuthFailure(_) => "auth_failure",
            PipelineError::SessionInvalid(_) => "session_invalid",
            PipelineError::UnsupportedFormat(_) => "unsupported_format",
            PipelineError::TranscodeFailed(_) => "transcode_failed",
            PipelineError::EmptyReply => "empty_reply",
            PipelineError::Backend(_) => "backend",
            PipelineError::Rejected(_) => "rejected",
            PipelineError::Config(_) => "config",
        }
    }
}

/// Classification of `reqwest` failures: anything that never produced an
/// HTTP status is a transport problem.
impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PipelineError::Backend(format!("malformed response body: {}", err))
        } else if err.is_builder() {
            PipelineError::Config(err.to_string())
        } else {
            PipelineError::Transport(err.to_string())
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn test_retryable_kinds() {
        assert!(PipelineError::Transport("timeout".into()).is_retryable());
        assert!(PipelineError::Backend("503".into()).is_retryable());
        assert!(!PipelineError::AuthFailure("401".into()).is_retryable());
        assert!(!PipelineError::SessionInvalid("404".into()).is_retryable());
        assert!(!PipelineError::EmptyReply.is_retryable());
        assert!(!PipelineError::Rejected("400".into()).is_retryable());
    }

    #[test]
    fn test_not_found_response_shape() {
        let response = AppError::NotFound("audio missing".into()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::NOT_FOUND);

        let body = response.into_body().try_into_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "not_found");
        assert_eq!(value["error"]["message"], "audio missing");
    }
}
