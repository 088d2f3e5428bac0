//! # Messaging Gateway
//!
//! Inbound webhook parsing, media download, and outbound delivery through
//! the messaging gateway.
//!
//! ## Components:
//! - **inbound**: `InboundMessage` from webhook parameters
//! - **media**: `MediaFetcher` for the attachment download stage
//! - **chunking**: splits replies that exceed the per-message limit
//! - **twilio**: `MessagingGateway` over the Twilio Messages API

pub mod chunking;
pub mod inbound;
pub mod media;
pub mod twilio;

pub use chunking::chunk_message;
pub use inbound::{mask_user_key, InboundMessage, MediaRef};
pub use media::{GatewayMediaFetcher, MediaFetcher};
pub use twilio::TwilioGateway;

use crate::error::PipelineResult;
use async_trait::async_trait;

/// Outbound delivery. Addresses are user keys (`+E164`); the gateway adds
/// its channel prefix.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_text(&self, user_key: &str, body: &str) -> PipelineResult<()>;

    /// Send a voice note whose bytes the gateway fetches from `media_url`.
    async fn send_audio(&self, user_key: &str, media_url: &str) -> PipelineResult<()>;
}
