//! HTTP webhook channel.
//!
//! POSTs each event as JSON to a configured endpoint, typically the ingress
//! of a message broker or another service's event intake.

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::FixEvent;
use crate::NotifyChannel;

/// Environment variable for the webhook URL.
pub(crate) const ENV_EVENTS_WEBHOOK_URL: &str = "REMEDIATION_EVENTS_WEBHOOK_URL";

/// Header carrying the routing key so receivers can route without parsing.
const EVENT_TYPE_HEADER: &str = "X-Event-Type";

/// HTTP webhook event channel.
pub struct WebhookChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_EVENTS_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Webhook events enabled");
        } else {
            debug!("Webhook events disabled (REMEDIATION_EVENTS_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook channel with a specific URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn envelope(event: &FixEvent) -> Envelope<'_> {
        Envelope {
            routing_key: event.routing_key(),
            title: event.title(),
            severity: event.severity().as_str(),
            event,
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &FixEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_EVENTS_WEBHOOK_URL.to_string()))?;

        let body = serde_json::to_vec(&Self::envelope(event))?;

        debug!(channel = "webhook", key = event.routing_key(), "Publishing event");

        let response = self
            .client
            .post(webhook_url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(EVENT_TYPE_HEADER, event.routing_key())
            .body(body)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(channel = "webhook", "Event published");
            Ok(())
        } else {
            let status = response.status();
            warn!(channel = "webhook", status = %status, "Webhook rejected event");
            Err(ChannelError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    routing_key: &'static str,
    title: String,
    severity: &'static str,
    event: &'a FixEvent,
}
