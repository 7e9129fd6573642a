//! Error types for source-hosting and CI provider calls.

use thiserror::Error;

/// Errors returned by [`crate::SourceHost`] and [`crate::CiProvider`] implementations.
#[derive(Debug, Error)]
pub enum ScmError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status
    #[error("{provider} API returned {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    /// The provider answered with a body we could not decode
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Provider is throttling us
    #[error("Rate limited by {provider}")]
    RateLimited { provider: &'static str },

    /// Missing or rejected credentials
    #[error("Authentication failed for {provider}")]
    Unauthorized { provider: &'static str },
}

impl ScmError {
    /// Stable category name, safe to persist or show to operators.
    ///
    /// Never includes the provider's message, URLs, or tokens.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "ScmHttpError",
            Self::Api { .. } => "ScmApiError",
            Self::Decode(_) => "ScmDecodeError",
            Self::NotFound(_) => "ScmNotFound",
            Self::RateLimited { .. } => "ScmRateLimited",
            Self::Unauthorized { .. } => "ScmUnauthorized",
        }
    }

    /// Whether a later retry of the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Decode(_) | Self::NotFound(_) | Self::Unauthorized { .. } => false,
        }
    }
}
