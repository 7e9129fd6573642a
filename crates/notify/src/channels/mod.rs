//! Event channel implementations.

pub mod memory;
pub mod webhook;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::FixEvent;

/// Trait for event channels (in-process broadcast, HTTP webhook, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver an event to this channel.
    async fn send(&self, event: &FixEvent) -> Result<(), ChannelError>;
}
