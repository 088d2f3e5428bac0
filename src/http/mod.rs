//! # Outbound HTTP
//!
//! Every external call (media download, STT, agent backend, TTS, gateway
//! delivery) goes through one shared `reqwest::Client` built by `pool`, and
//! every stage wraps its call in a `retry::RetryPolicy` tuned for that stage.

pub mod pool;
pub mod retry;
#[cfg(test)]
pub(crate) mod test_server;

pub use pool::{build_client, status_error};
pub use retry::RetryPolicy;
