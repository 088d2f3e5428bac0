//! Agentforce REST adapter.
//!
//! ## Endpoints:
//! - `POST {api_base}/agents/{agent_id}/sessions`: open a session
//! - `POST {api_base}/sessions/{id}/messages`: send one turn
//! - `GET  {api_base}/sessions/{id}/messages`: history, read after a 204
//!
//! ## Status mapping:
//! - 401: token invalidated and refreshed once, a second 401 is `AuthFailure`
//! - 403: `AuthFailure`
//! - 404 / 410, or a 400 naming an expired session: `SessionInvalid`
//! - 429 / 5xx: `Backend`
//! - other 4xx: `Rejected`

use super::auth::TokenProvider;
use super::AgentBackend;
use crate::config::AgentConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::pool::{status_error, truncate};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<AgentMessage>,
}

#[derive(Debug, Deserialize)]
struct AgentMessage {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Map a non-success status from the session endpoints.
fn classify_status(status: StatusCode, body: &str) -> PipelineError {
    let lower = body.to_ascii_lowercase();
    let names_session = lower.contains("session")
        && ["expired", "invalid", "not found", "ended", "closed"]
            .iter()
            .any(|word| lower.contains(word));

    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => PipelineError::SessionInvalid(format!(
            "agent returned {}: {}",
            status.as_u16(),
            truncate(body, 200)
        )),
        StatusCode::BAD_REQUEST if names_session => {
            PipelineError::SessionInvalid(format!("agent rejected session: {}", truncate(body, 200)))
        }
        _ => status_error("agent", status, body),
    }
}

/// Reply text from a 200 turn response.
///
/// Fragments are joined in the order received. Any `Failure` message turns
/// the whole reply into a backend error.
fn reply_from_messages(response: MessagesResponse) -> PipelineResult<String> {
    if let Some(failure) = response.messages.iter().find(|m| m.kind == "Failure") {
        return Err(PipelineError::Backend(format!(
            "agent reported failure (code={}): {}",
            failure.code.as_deref().unwrap_or("none"),
            failure.errors.join("; ")
        )));
    }

    let fragments: Vec<&str> = response
        .messages
        .iter()
        .filter_map(|m| m.message.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();

    if fragments.is_empty() {
        Err(PipelineError::EmptyReply)
    } else {
        Ok(fragments.join("\n"))
    }
}

/// Reply text from the history read after a 204: the last message.
fn reply_from_history(response: MessagesResponse) -> PipelineResult<String> {
    response
        .messages
        .last()
        .and_then(|m| m.message.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or(PipelineError::EmptyReply)
}

pub struct AgentforceClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    api_base: String,
    agent_id: String,
    instance_url: String,
}

impl AgentforceClient {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenProvider>, config: &AgentConfig) -> Self {
        Self {
            client,
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            agent_id: config.agent_id.clone(),
            instance_url: config.instance_url.clone(),
        }
    }

    /// Send a request with the cached bearer token, refreshing it once if
    /// the backend answers 401.
    async fn authorized<F>(&self, build: F) -> PipelineResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Agent rejected bearer token, refreshing once");
        self.tokens.invalidate(&token).await;
        let token = self.tokens.token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::AuthFailure(format!(
                "agent rejected a freshly issued token: {}",
                truncate(&body, 200)
            )));
        }
        Ok(response)
    }

    async fn fetch_history(&self, session_id: &str) -> PipelineResult<String> {
        let url = format!("{}/sessions/{}/messages", self.api_base, session_id);
        let response = self.authorized(|client| client.get(&url)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        reply_from_history(response.json().await?)
    }
}

#[async_trait]
impl AgentBackend for AgentforceClient {
    async fn create_session(&self, user_key: &str) -> PipelineResult<String> {
        let url = format!("{}/agents/{}/sessions", self.api_base, self.agent_id);
        let body = json!({
            "externalSessionKey": format!("whatsapp_{}", user_key),
            "instanceConfig": { "endpoint": self.instance_url },
            "streamingCapabilities": { "chunkTypes": ["Text"] },
            "bypassUser": true,
        });

        let response = self.authorized(|client| client.post(&url).json(&body)).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // A 404 here means the agent id is wrong, not a stale session
            return Err(match status {
                StatusCode::NOT_FOUND => PipelineError::Rejected(format!(
                    "agent '{}' not found: {}",
                    self.agent_id,
                    truncate(&text, 200)
                )),
                _ => status_error("agent", status, &text),
            });
        }

        let session: SessionResponse = response.json().await?;
        let session_id = session
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PipelineError::Backend("session response has no sessionId".to_string()))?;
        info!(session_id = %session_id, "Opened agent session");
        Ok(session_id)
    }

    async fn send_turn(&self, session_id: &str, sequence_number: u64, text: &str) -> PipelineResult<String> {
        let url = format!("{}/sessions/{}/messages", self.api_base, session_id);
        let body = json!({
            "message": {
                "sequenceId": sequence_number,
                "type": "Text",
                "text": text,
            },
            "variables": [],
        });
        debug!(session_id, sequence_number, chars = text.chars().count(), "Sending agent turn");

        let response = self.authorized(|client| client.post(&url).json(&body)).await?;
        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!(session_id, "Agent accepted turn without a body, reading history");
                self.fetch_history(session_id).await
            }
            status if status.is_success() => reply_from_messages(response.json().await?),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_status(status, &body))
            }
        }
    }
}
