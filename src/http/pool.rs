//! Shared connection pool for all upstream services.

use crate::config::HttpConfig;
use crate::error::PipelineError;
use reqwest::StatusCode;
use std::time::Duration;

/// Build the client every adapter clones.
///
/// `reqwest::Client` is an `Arc` internally, so clones share one pool of
/// keep-alive connections. No request timeout is set here: each stage
/// enforces its own through `RetryPolicy`, because the agent stage tolerates
/// far longer waits than a media download.
pub fn build_client(config: &HttpConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .user_agent(concat!("voice-bridge/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Map a non-success upstream status to a pipeline failure kind.
///
/// Adapters with backend-specific statuses (the agent's 404 meaning
/// "session gone", the STT's 400 meaning "bad encoding") check those first
/// and fall through to this for everything else.
pub fn status_error(service: &str, status: StatusCode, body: &str) -> PipelineError {
    let detail = format!("{} returned {}: {}", service, status.as_u16(), truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PipelineError::AuthFailure(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => PipelineError::Backend(detail),
        s if s.is_server_error() => PipelineError::Backend(detail),
        _ => PipelineError::Rejected(detail),
    }
}

/// Cut a response body down for log lines without splitting a UTF-8 char.
pub fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        body.to_string()
    } else {
        let cut: String = body.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
