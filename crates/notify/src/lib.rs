//! Event bus adapter for the remediation pipeline.
//!
//! This crate publishes remediation lifecycle events ([`FixEvent`]) to every
//! configured channel.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{FixEvent, Notifier};
//!
//! # async fn example() {
//! let notifier = Notifier::from_env();
//!
//! let results = notifier
//!     .notify_and_wait(FixEvent::FixFailed {
//!         fix_attempt_id: "3f1c".to_string(),
//!         task_id: "task-42".to_string(),
//!         repository: "acme/widgets".to_string(),
//!         reason: "Task execution failed".to_string(),
//!         error_pattern: None,
//!         timestamp: chrono::Utc::now(),
//!     })
//!     .await;
//! # let _ = results;
//! # }
//! ```
//!
//! # Configuration
//!
//! - `REMEDIATION_EVENTS_WEBHOOK_URL`: webhook endpoint (enables the webhook channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all publication
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for event channels
//! - [`MemoryChannel`] broadcasts to in-process subscribers
//! - [`WebhookChannel`] POSTs events to an HTTP endpoint
//! - [`Notifier`] dispatches events to all enabled channels

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::memory::MemoryChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{FixEvent, Severity};

use std::sync::Arc;
use tracing::{info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Central event dispatcher.
///
/// The `Notifier` manages multiple channels and dispatches events to all
/// enabled channels.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Event publication disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let webhook = WebhookChannel::from_env();
        if webhook.enabled() {
            info!("Webhook event channel enabled");
            channels.push(Arc::new(webhook));
        }

        if channels.is_empty() {
            warn!("No event channels configured");
        } else {
            info!(channel_count = channels.len(), "Event bus initialized");
        }

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when events are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Publish an event and wait for all channels to complete.
    ///
    /// Returns one result per enabled channel.
    pub async fn notify_and_wait(&self, event: FixEvent) -> Vec<(String, Result<(), ChannelError>)> {
        if !self.has_channels() {
            return vec![];
        }

        let mut results = vec![];

        for channel in self.channels.iter().filter(|c| c.enabled()) {
            let channel_name = channel.name().to_string();
            let result = channel.send(&event).await;
            if let Err(e) = &result {
                warn!(
                    channel = %channel_name,
                    key = event.routing_key(),
                    error = %e,
                    "Event delivery failed"
                );
            }
            results.push((channel_name, result));
        }

        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}
