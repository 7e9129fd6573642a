//! In-process broadcast channel.
//!
//! Lets other components of the same process (and tests) subscribe to the
//! event stream without any external broker.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::FixEvent;
use crate::NotifyChannel;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast channel fan-out to any number of in-process subscribers.
pub struct MemoryChannel {
    sender: broadcast::Sender<FixEvent>,
}

impl MemoryChannel {
    /// Create a channel buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FixEvent> {
        self.sender.subscribe()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl NotifyChannel for MemoryChannel {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &FixEvent) -> Result<(), ChannelError> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                debug!(channel = "memory", receivers, key = event.routing_key(), "Event broadcast");
            }
            Err(_) => {
                // A broadcast with nobody listening is not a delivery failure.
                debug!(channel = "memory", key = event.routing_key(), "No subscribers");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn failed_event() -> FixEvent {
        FixEvent::FixFailed {
            fix_attempt_id: "a-1".into(),
            task_id: "t-1".into(),
            repository: "acme/widgets".into(),
            reason: "Task execution failed".into(),
            error_pattern: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let channel = MemoryChannel::default();
        let mut rx = channel.subscribe();

        channel.send(&failed_event()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.routing_key(), "fix.failed");
        assert_eq!(received.fix_attempt_id(), "a-1");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_ok() {
        let channel = MemoryChannel::new(4);
        assert!(channel.send(&failed_event()).await.is_ok());
    }
}
