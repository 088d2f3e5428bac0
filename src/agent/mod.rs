//! # Conversational Agent
//!
//! Everything between a transcript and the agent's reply.
//!
//! ## Components:
//! - **auth**: cached bearer token for the backend
//! - **client**: the Agentforce REST adapter implementing `AgentBackend`
//! - **session**: one conversation session per user, with sequence numbers
//! - **executor**: one agent turn with retry and session recovery

pub mod auth;
pub mod client;
pub mod executor;
pub mod session;

pub use auth::{ClientCredentials, TokenCache};
pub use client::AgentforceClient;
pub use executor::TurnExecutor;
pub use session::SessionManager;

use crate::error::PipelineResult;
use async_trait::async_trait;

/// Stage contract for the agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Open a session for `user_key` and return the backend's session id.
    async fn create_session(&self, user_key: &str) -> PipelineResult<String>;

    /// Send one user message. Returns the reply text, or
    /// `PipelineError::EmptyReply` when the backend answered with nothing.
    async fn send_turn(&self, session_id: &str, sequence_number: u64, text: &str) -> PipelineResult<String>;
}
