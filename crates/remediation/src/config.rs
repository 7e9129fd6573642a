//! Service configuration.
//!
//! Read from a JSON file (every field has a default, so `{}` is valid) and
//! then overridden by CLI flags / environment variables in `main`.

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ci::classifier::{default_patterns, ErrorClassifier, PatternConfig};
use crate::sensors::github_actions::PollerConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Ordered classification rules; empty means the built-in table
    pub patterns: Vec<PatternConfig>,
    pub limits: TextLimits,
    pub pull_request: PullRequestConfig,
    pub task_service: TaskServiceConfig,
    pub github: GitHubConfig,
    pub poller: PollerConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreConfig,
}

impl RemediationConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.limits.error_message_chars > 0, "limits.error_message_chars must be > 0");
        ensure!(self.limits.error_log_chars > 0, "limits.error_log_chars must be > 0");
        ensure!(self.limits.pr_excerpt_chars > 0, "limits.pr_excerpt_chars must be > 0");
        ensure!(
            !self.pull_request.branch_prefix.trim().is_empty(),
            "pull_request.branch_prefix must not be empty"
        );
        ensure!(
            !self.pull_request.fallback_base_branch.trim().is_empty(),
            "pull_request.fallback_base_branch must not be empty"
        );
        ensure!(self.consumer.concurrency > 0, "consumer.concurrency must be > 0");
        ensure!(self.consumer.queue_capacity > 0, "consumer.queue_capacity must be > 0");
        ensure!(self.poller.poll_interval_secs > 0, "poller.poll_interval_secs must be > 0");
        self.classifier()?;
        Ok(())
    }

    /// Build the classifier from the configured rules.
    pub fn classifier(&self) -> Result<ErrorClassifier> {
        if self.patterns.is_empty() {
            return Ok(ErrorClassifier::with_default_patterns());
        }
        ErrorClassifier::from_config(&self.patterns).context("Invalid classification pattern")
    }

    /// Rules in effect (configured or built-in).
    #[must_use]
    pub fn effective_patterns(&self) -> Vec<PatternConfig> {
        if self.patterns.is_empty() {
            default_patterns()
        } else {
            self.patterns.clone()
        }
    }
}

/// Caps applied to untrusted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLimits {
    /// Error message in task descriptions
    #[serde(default = "default_error_message_chars")]
    pub error_message_chars: usize,
    /// Log excerpt in task descriptions
    #[serde(default = "default_error_log_chars")]
    pub error_log_chars: usize,
    /// Error excerpt in pull-request bodies
    #[serde(default = "default_pr_excerpt_chars")]
    pub pr_excerpt_chars: usize,
}

fn default_error_message_chars() -> usize {
    1000
}
fn default_error_log_chars() -> usize {
    4000
}
fn default_pr_excerpt_chars() -> usize {
    500
}

impl Default for TextLimits {
    fn default() -> Self {
        Self {
            error_message_chars: default_error_message_chars(),
            error_log_chars: default_error_log_chars(),
            pr_excerpt_chars: default_pr_excerpt_chars(),
        }
    }
}

/// Pull-request creation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestConfig {
    /// Head branch is `{branch_prefix}{attempt id}`
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Base when neither the failure nor the repository names one
    #[serde(default = "default_fallback_base")]
    pub fallback_base_branch: String,
    #[serde(default)]
    pub draft: bool,
    /// Age after which an unfinished completion claim may be re-taken
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
}

fn default_branch_prefix() -> String {
    "automated-fix/".to_string()
}
fn default_fallback_base() -> String {
    "main".to_string()
}
fn default_claim_ttl() -> u64 {
    600
}

impl Default for PullRequestConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            fallback_base_branch: default_fallback_base(),
            draft: false,
            claim_ttl_secs: default_claim_ttl(),
        }
    }
}

impl PullRequestConfig {
    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

/// Task-execution service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskServiceConfig {
    #[serde(default = "default_task_service_url")]
    pub url: String,
    /// Bearer token, normally supplied via `TASKS_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_task_service_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_http_timeout() -> u64 {
    30
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            url: default_task_service_url(),
            api_key: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

/// GitHub API access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Normally supplied via `GITHUB_TOKEN`
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_github_api() -> String {
    scm::github::DEFAULT_API_URL.to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            token: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Message consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum messages handled at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Redeliveries of a failed message before it is dropped
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Base delay before a redelivery, multiplied by the delivery count
    #[serde(default = "default_redelivery_delay")]
    pub redelivery_delay_ms: u64,
}

fn default_concurrency() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_redeliveries() -> u32 {
    3
}
fn default_redelivery_delay() -> u64 {
    2000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            max_redeliveries: default_max_redeliveries(),
            redelivery_delay_ms: default_redelivery_delay(),
        }
    }
}

/// Persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite:` URL; unset keeps everything in memory
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}
