//! # Voice Pipeline
//!
//! - **orchestrator**: sequences the stages of one turn
//! - **telemetry**: per-stage timings and outcome counters for `/metrics`

pub mod orchestrator;
pub mod telemetry;

pub use orchestrator::{Orchestrator, PipelineDeps, TurnOutcome};
pub use telemetry::PipelineTelemetry;
