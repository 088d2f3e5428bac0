//! # Retry Policy
//!
//! One wrapper for every retryable external call. A policy is built per stage
//! from that stage's `StageConfig`:
//!
//! - **timeout**: applied to each attempt; an elapsed timeout becomes a
//!   `Transport` error. The abandoned call is not cancelled upstream, its
//!   result is simply dropped.
//! - **max_attempts**: total attempts, including the first
//! - **backoff**: `base * 2^(attempt - 1)`, capped at `max_delay`
//!
//! Only kinds where `PipelineError::is_retryable()` is true are retried.

use crate::config::StageConfig;
use crate::error::{PipelineError, PipelineResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub stage: &'static str,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_stage(stage: &'static str, config: &StageConfig) -> Self {
        Self {
            stage,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base(),
            max_delay: Duration::from_secs(5),
            timeout: config.timeout(),
        }
    }

    /// A policy that makes exactly one attempt with the given timeout.
    pub fn single(stage: &'static str, timeout: Duration) -> Self {
        Self {
            stage,
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            timeout,
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> PipelineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Transport(format!(
                    "{} timed out after {}ms",
                    self.stage,
                    self.timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        stage = self.stage,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying stage"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
