//! Error types for event publication.

use thiserror::Error;

/// Errors that can occur when publishing to a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote endpoint rejected the event
    #[error("Endpoint returned {status}")]
    Rejected { status: u16 },
}
