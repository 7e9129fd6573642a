//! Remediation lifecycle events published on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
}

impl Severity {
    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
        }
    }
}

/// Events emitted by the remediation pipeline.
///
/// Ids are carried as strings so subscribers need no knowledge of the
/// pipeline's id types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixEvent {
    /// A fix-generation task was dispatched for a build failure
    FixAttempted {
        fix_attempt_id: String,
        build_id: String,
        task_id: String,
        repository: String,
        error_message: String,
        error_pattern: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The task finished and a pull request was opened
    FixSucceeded {
        fix_attempt_id: String,
        task_id: String,
        pull_request_number: u64,
        pull_request_url: String,
        repository: String,
        error_pattern: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The task failed, or the pull request could not be opened
    FixFailed {
        fix_attempt_id: String,
        task_id: String,
        repository: String,
        reason: String,
        error_pattern: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl FixEvent {
    /// Topic-style routing key (e.g., `fix.attempted`).
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        match self {
            Self::FixAttempted { .. } => "fix.attempted",
            Self::FixSucceeded { .. } => "fix.succeeded",
            Self::FixFailed { .. } => "fix.failed",
        }
    }

    /// Get a short title for this event.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::FixAttempted { repository, .. } => format!("Fix Attempted: {repository}"),
            Self::FixSucceeded {
                repository,
                pull_request_number,
                ..
            } => format!("Fix Succeeded: {repository} #{pull_request_number}"),
            Self::FixFailed { repository, .. } => format!("Fix Failed: {repository}"),
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::FixAttempted { .. } | Self::FixSucceeded { .. } => Severity::Info,
            Self::FixFailed { .. } => Severity::Warning,
        }
    }

    /// The fix attempt this event belongs to.
    #[must_use]
    pub fn fix_attempt_id(&self) -> &str {
        match self {
            Self::FixAttempted { fix_attempt_id, .. }
            | Self::FixSucceeded { fix_attempt_id, .. }
            | Self::FixFailed { fix_attempt_id, .. } => fix_attempt_id,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::FixAttempted { timestamp, .. }
            | Self::FixSucceeded { timestamp, .. }
            | Self::FixFailed { timestamp, .. } => *timestamp,
        }
    }
}
