//! Domain records: builds, build failures and fix attempts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use scm::WorkflowRun;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::PipelineError;

// =============================================================================
// Build
// =============================================================================

/// Status of a CI build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Success,
    Failure,
    Cancelled,
}

impl BuildStatus {
    /// Derive a status from a provider run state and conclusion.
    #[must_use]
    pub fn from_run(run: &WorkflowRun) -> Self {
        match run.state {
            scm::RunState::Queued => Self::Queued,
            scm::RunState::InProgress => Self::InProgress,
            scm::RunState::Completed => match run.conclusion.as_deref() {
                Some("success" | "neutral" | "skipped") => Self::Success,
                Some("cancelled") => Self::Cancelled,
                _ => Self::Failure,
            },
        }
    }

    /// Terminal statuses are never overwritten.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

/// A CI workflow run as tracked by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    /// Provider run id, unique across builds
    pub run_id: u64,
    /// `owner/repo`
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub workflow_name: String,
    pub status: BuildStatus,
    /// Provider conclusion as reported (`failure`, `timed_out`, ...)
    pub conclusion: Option<String>,
    pub url: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Representative error lines of the failed jobs
    pub error_messages: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Create a new record for a provider run.
    #[must_use]
    pub fn from_run(run: &WorkflowRun) -> Self {
        let mut build = Self {
            id: Uuid::new_v4(),
            run_id: run.id,
            repository: format!("{}/{}", run.owner, run.repository),
            branch: run.head_branch.clone(),
            commit_sha: run.head_sha.clone(),
            workflow_name: run.workflow_name.clone(),
            status: BuildStatus::Queued,
            conclusion: None,
            url: run.html_url.clone(),
            started_at: None,
            completed_at: None,
            error_messages: Vec::new(),
            created_at: run.created_at,
            updated_at: run.updated_at,
        };
        build.apply_run(run);
        build
    }

    /// Refresh status and timestamps from the provider.
    ///
    /// Returns `false` (and changes nothing) once the build is terminal.
    pub fn apply_run(&mut self, run: &WorkflowRun) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = BuildStatus::from_run(run);
        self.conclusion.clone_from(&run.conclusion);
        self.updated_at = run.updated_at;
        self.started_at = run.started_at.or(Some(run.created_at));
        if self.status.is_terminal() {
            self.completed_at = Some(run.updated_at);
        }
        true
    }
}

// =============================================================================
// BuildFailure
// =============================================================================

/// A failed build, the unit the orchestrator classifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub id: Uuid,
    /// Owning build, when the failure came from the poller
    #[serde(default)]
    pub build_id: Option<Uuid>,
    /// `owner/repo`
    pub repository: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    pub error_message: String,
    #[serde(default)]
    pub error_log: Option<String>,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub job_name: Option<String>,
    /// Classification label, set by the orchestrator before persistence
    #[serde(default)]
    pub error_pattern: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl BuildFailure {
    /// Start a failure record with the required fields.
    #[must_use]
    pub fn new(repository: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id: None,
            repository: repository.into(),
            branch: String::new(),
            commit_sha: String::new(),
            error_message: error_message.into(),
            error_log: None,
            workflow_name: String::new(),
            job_name: None,
            error_pattern: None,
            failed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_build(mut self, build: &Build) -> Self {
        self.build_id = Some(build.id);
        self.branch.clone_from(&build.branch);
        self.commit_sha.clone_from(&build.commit_sha);
        self.workflow_name.clone_from(&build.workflow_name);
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    #[must_use]
    pub fn with_commit(mut self, commit_sha: impl Into<String>) -> Self {
        self.commit_sha = commit_sha.into();
        self
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow_name: impl Into<String>) -> Self {
        self.workflow_name = workflow_name.into();
        self
    }

    #[must_use]
    pub fn with_job(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    #[must_use]
    pub fn with_log(mut self, error_log: impl Into<String>) -> Self {
        self.error_log = Some(error_log.into());
        self
    }

    #[must_use]
    pub fn with_error_pattern(mut self, pattern: Option<String>) -> Self {
        self.error_pattern = pattern;
        self
    }
}

// =============================================================================
// FixAttempt
// =============================================================================

/// Lifecycle of a fix attempt. `InProgress` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl FixStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown fix status: {other}")),
        }
    }
}

/// One automated attempt to fix a build failure via an external task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: Uuid,
    pub build_failure_id: Uuid,
    /// Task id issued by the execution service (one task per attempt)
    pub task_id: String,
    /// `owner/repo`, copied from the failure
    pub repository: String,
    pub error_pattern: Option<String>,
    /// Error message of the failure being fixed
    pub error_message: String,
    pub status: FixStatus,
    pub pull_request_number: Option<u64>,
    pub pull_request_url: Option<String>,
    /// Short failure category; never raw collaborator output
    pub failure_reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while one completion delivery owns pull-request creation
    pub completion_claimed_at: Option<DateTime<Utc>>,
}

impl FixAttempt {
    /// New in-progress attempt for `failure`, tracked by `task_id`.
    #[must_use]
    pub fn new(failure: &BuildFailure, task_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_failure_id: failure.id,
            task_id: task_id.into(),
            repository: failure.repository.clone(),
            error_pattern: failure.error_pattern.clone(),
            error_message: failure.error_message.clone(),
            status: FixStatus::InProgress,
            pull_request_number: None,
            pull_request_url: None,
            failure_reason: None,
            attempted_at: Utc::now(),
            completed_at: None,
            completion_claimed_at: None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record the opened pull request.
    pub fn mark_succeeded(&mut self, number: u64, url: impl Into<String>) -> Result<(), PipelineError> {
        self.ensure_open(FixStatus::Succeeded)?;
        self.status = FixStatus::Succeeded;
        self.pull_request_number = Some(number);
        self.pull_request_url = Some(url.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failure with a short reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), PipelineError> {
        self.ensure_open(FixStatus::Failed)?;
        self.status = FixStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self, to: FixStatus) -> Result<(), PipelineError> {
        if self.status.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                attempt_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

// =============================================================================
// RepositoryName
// =============================================================================

/// A validated `owner/repo` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName {
    pub owner: String,
    pub name: String,
}

impl RepositoryName {
    /// Parse `owner/repo`. Exactly one separator and two non-empty parts.
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidRepository(value.to_string());

        let (owner, name) = value.split_once('/').ok_or_else(invalid)?;
        let valid_part = |part: &str| {
            !part.is_empty()
                && part.trim() == part
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid_part(owner) || !valid_part(name) {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scm::RunState;

    fn run(state: RunState, conclusion: Option<&str>) -> WorkflowRun {
        WorkflowRun {
            id: 77,
            owner: "acme".into(),
            repository: "widgets".into(),
            workflow_name: "CI".into(),
            head_branch: "main".into(),
            head_sha: "deadbeef".into(),
            state,
            conclusion: conclusion.map(String::from),
            html_url: "https://github.com/acme/widgets/actions/runs/77".into(),
            created_at: Utc::now(),
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_repository_name_parse() {
        let repo = RepositoryName::parse("acme/widgets").unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.to_string(), "acme/widgets");
    }

    #[test]
    fn test_repository_name_rejects_malformed() {
        for bad in ["invalid", "a/b/c", "/repo", "owner/", "", "own er/repo", "owner/re po"] {
            assert!(
                matches!(RepositoryName::parse(bad), Err(PipelineError::InvalidRepository(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_build_from_run() {
        let build = Build::from_run(&run(RunState::Completed, Some("failure")));
        assert_eq!(build.repository, "acme/widgets");
        assert_eq!(build.status, BuildStatus::Failure);
        assert!(build.completed_at.is_some());
    }

    #[test]
    fn test_terminal_build_is_never_overwritten() {
        let mut build = Build::from_run(&run(RunState::Completed, Some("success")));
        assert!(!build.apply_run(&run(RunState::InProgress, None)));
        assert_eq!(build.status, BuildStatus::Success);
    }

    #[test]
    fn test_in_progress_build_advances() {
        let mut build = Build::from_run(&run(RunState::InProgress, None));
        assert_eq!(build.status, BuildStatus::InProgress);
        assert!(build.apply_run(&run(RunState::Completed, Some("cancelled"))));
        assert_eq!(build.status, BuildStatus::Cancelled);
    }

    #[test]
    fn test_fix_attempt_transitions_are_monotonic() {
        let failure = BuildFailure::new("acme/widgets", "boom");
        let mut attempt = FixAttempt::new(&failure, "task-1");
        assert_eq!(attempt.status, FixStatus::InProgress);

        attempt.mark_succeeded(5, "https://example.test/pull/5").unwrap();
        assert_eq!(attempt.status, FixStatus::Succeeded);
        assert!(attempt.completed_at.is_some());

        let err = attempt.mark_failed("late").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(attempt.status, FixStatus::Succeeded);
        assert!(attempt.failure_reason.is_none());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [FixStatus::InProgress, FixStatus::Succeeded, FixStatus::Failed] {
            assert_eq!(status.as_str().parse::<FixStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<BuildStatus>().is_err());
    }
}
