//! # Pipeline Telemetry
//!
//! Per-stage timings, turn outcome counters and the error sink for the
//! background audio stage. Read by `GET /metrics`.

use crate::error::PipelineResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Stage labels used as metric keys.
pub mod stage {
    pub const DOWNLOAD: &str = "download";
    pub const TRANSCODE: &str = "transcode";
    pub const SESSION_PREWARM: &str = "session_prewarm";
    pub const STT: &str = "stt";
    pub const AGENT: &str = "agent";
    pub const DELIVERY: &str = "delivery";
    pub const TTS: &str = "tts";
    pub const AUDIO_DELIVERY: &str = "audio_delivery";
    pub const TURN: &str = "turn";
}

/// Timing aggregate for one stage.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StageStats {
    pub count: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl StageStats {
    fn record(&mut self, elapsed_ms: u64, ok: bool) {
        if self.count == 0 || elapsed_ms < self.min_ms {
            self.min_ms = elapsed_ms;
        }
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.count += 1;
        self.total_ms += elapsed_ms;
        if !ok {
            self.failures += 1;
        }
    }

    pub fn average_ms(&self) -> f64 {
        if self.count > 0 {
            self.total_ms as f64 / self.count as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub stages: BTreeMap<String, StageStats>,
    pub outcomes: BTreeMap<String, u64>,
    /// Background audio failures keyed by `stage:kind`
    pub background_failures: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    inner: RwLock<TelemetrySnapshot>,
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage(&self, stage: &str, elapsed: Duration, ok: bool) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .stages
            .entry(stage.to_string())
            .or_default()
            .record(elapsed.as_millis() as u64, ok);
    }

    pub fn record_outcome(&self, outcome: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner.outcomes.entry(outcome.to_string()).or_default() += 1;
    }

    /// Error sink for work nobody is waiting on.
    pub fn record_background_failure(&self, stage: &str, kind: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner
            .background_failures
            .entry(format!("{}:{}", stage, kind))
            .or_default() += 1;
    }

    /// Await `fut` and record its duration under `stage`.
    pub async fn timed<T, F>(&self, stage: &str, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record_stage(stage, started.elapsed(), result.is_ok());
        result
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
