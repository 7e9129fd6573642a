//! Provider-neutral types for repositories, pull requests and workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Owner login (user or organization)
    pub owner: String,
    /// Repository name without owner
    pub name: String,
    /// Default branch (e.g., "main")
    pub default_branch: String,
}

/// Request to open a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub owner: String,
    pub repo: String,
    pub title: String,
    pub body: String,
    /// Branch carrying the changes
    pub head: String,
    /// Branch the changes should be merged into
    pub base: String,
    pub draft: bool,
}

/// An opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Provider-global id
    pub id: u64,
    /// Per-repository number
    pub number: u64,
    pub html_url: String,
    pub title: String,
    pub owner: String,
    pub repository_name: String,
}

/// Lifecycle state of a workflow run as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    Completed,
}

/// One CI workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Provider run id (unique per provider)
    pub id: u64,
    pub owner: String,
    pub repository: String,
    pub workflow_name: String,
    pub head_branch: String,
    pub head_sha: String,
    pub state: RunState,
    /// Final conclusion once completed (success, failure, cancelled, ...)
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Whether the run completed with a failing conclusion.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == RunState::Completed
            && matches!(
                self.conclusion.as_deref(),
                Some("failure" | "timed_out" | "startup_failure")
            )
    }
}

/// One job inside a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub run_id: u64,
    pub name: String,
    pub conclusion: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowJob {
    /// Whether this job failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.conclusion.as_deref(), Some("failure" | "timed_out"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: RunState, conclusion: Option<&str>) -> WorkflowRun {
        WorkflowRun {
            id: 1,
            owner: "acme".into(),
            repository: "widgets".into(),
            workflow_name: "CI".into(),
            head_branch: "main".into(),
            head_sha: "abc".into(),
            state,
            conclusion: conclusion.map(String::from),
            html_url: String::new(),
            created_at: Utc::now(),
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_failure_detection() {
        assert!(run(RunState::Completed, Some("failure")).is_failed());
        assert!(run(RunState::Completed, Some("timed_out")).is_failed());
        assert!(!run(RunState::Completed, Some("success")).is_failed());
        assert!(!run(RunState::Completed, Some("cancelled")).is_failed());
        assert!(!run(RunState::InProgress, None).is_failed());
    }
}
