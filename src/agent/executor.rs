//! Agent turn execution.
//!
//! One call to `TurnExecutor::run` is one user turn. Each attempt leases a
//! fresh sequence number, so a retried turn never reuses a number the
//! backend may already have seen. Transport and backend failures go through
//! the stage's `RetryPolicy`; a session-invalid failure drops the session and
//! replays the whole turn once against a new one.
//!
//! A turn holds its user's turn lock from the first attempt to the last, so
//! two messages from one user reach the backend in sequence order and never
//! interleave.

use super::session::SessionManager;
use super::AgentBackend;
use crate::error::{PipelineError, PipelineResult};
use crate::http::RetryPolicy;
use crate::messaging::mask_user_key;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TurnExecutor {
    sessions: Arc<SessionManager>,
    backend: Arc<dyn AgentBackend>,
    policy: RetryPolicy,
}

impl TurnExecutor {
    pub fn new(sessions: Arc<SessionManager>, backend: Arc<dyn AgentBackend>, policy: RetryPolicy) -> Self {
        Self {
            sessions,
            backend,
            policy,
        }
    }

    pub async fn run(&self, user_key: &str, text: &str) -> PipelineResult<String> {
        let _turn = self.sessions.turn_lock(user_key).await;
        match self.run_with_retries(user_key, text).await {
            Err(PipelineError::SessionInvalid(detail)) => {
                warn!(user = %mask_user_key(user_key), %detail, "Session rejected by agent, retrying turn on a new session");
                self.run_with_retries(user_key, text).await
            }
            other => other,
        }
    }

    async fn run_with_retries(&self, user_key: &str, text: &str) -> PipelineResult<String> {
        self.policy
            .run(|attempt| async move {
                let lease = self.sessions.acquire(user_key).await?;
                debug!(
                    user = %mask_user_key(user_key),
                    attempt,
                    session_id = %lease.session_id,
                    sequence_number = lease.sequence_number,
                    "Agent turn attempt"
                );

                match self
                    .backend
                    .send_turn(&lease.session_id, lease.sequence_number, text)
                    .await
                {
                    Ok(reply) => Ok(reply),
                    Err(err) => {
                        self.sessions
                            .record_turn_failure(user_key, &lease.session_id, &err)
                            .await;
                        Err(err)
                    }
                }
            })
            .await
    }
}
