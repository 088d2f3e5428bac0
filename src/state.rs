//! # Application State Management
//!
//! State shared by every HTTP worker: the configuration, request metrics
//! collected by the middleware, and the pipeline orchestrator (which owns the
//! session table and both caches).
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - actix clones `AppState` into every worker, so each field is either
//!   immutable or behind an `Arc`
//! - cloning an `Arc` copies a pointer, never the data
//!
//! ### RwLock
//! - many readers or one writer at a time
//! - the request metrics are written on every request and read by `/metrics`
//! - a poisoned lock (a writer panicked) still holds usable counters, so
//!   `PoisonError::into_inner` recovers the guard instead of panicking
//!
//! ### Ownership of pipeline state
//! The session table and the caches are not stored here directly; they live
//! inside `Orchestrator` and are reached through it, so there is exactly one
//! copy per process.

use crate::config::AppConfig;
use crate::pipeline::Orchestrator;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The application state handed to handlers as `web::Data<AppState>`.
///
/// ## Fields:
/// - `config`: effective configuration, read-only after startup
/// - `metrics`: per-endpoint HTTP counters, updated by `MetricsMiddleware`
/// - `pipeline`: the turn orchestrator
/// - `start_time`: for the uptime reported by `/health`
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub pipeline: Arc<Orchestrator>,
    pub start_time: Instant,
}

/// HTTP request metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended with a 4xx or 5xx status
    pub error_count: u64,

    /// Key: "METHOD /path", e.g. "POST /webhook"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for one endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<Orchestrator>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline,
            start_time: Instant::now(),
        }
    }

    /// Record one finished request (called by the metrics middleware).
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /path"
    /// - **duration_ms**: time spent in the handler chain
    /// - **is_error**: whether the response status was 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so the lock is not held while the
    /// response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let (state, _) = test_support::app_state();
        state.record_endpoint_request("POST /webhook", 30, false);
        state.record_endpoint_request("POST /webhook", 10, true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        let webhook = &metrics.endpoint_metrics["POST /webhook"];
        assert!((webhook.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((webhook.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
