//! Source-hosting and CI provider abstraction.
//!
//! The remediation pipeline talks to two capabilities of a hosting provider:
//!
//! - [`SourceHost`]: open pull requests and read repository metadata
//! - [`CiProvider`]: list workflow runs, their failed jobs and job logs
//!
//! [`GitHubProvider`] implements both over the GitHub REST API. Callers hold
//! them as `Arc<dyn SourceHost>` / `Arc<dyn CiProvider>` so tests can swap in
//! stubs without touching orchestration code.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod github;
pub mod types;

pub use error::ScmError;
pub use github::GitHubProvider;
pub use types::{NewPullRequest, PullRequest, Repository, RunState, WorkflowJob, WorkflowRun};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Pull-request and repository operations.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Open a pull request.
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest, ScmError>;

    /// Fetch repository metadata (used for the default branch).
    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError>;
}

/// Read access to CI workflow runs.
#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// List runs that reached `completed`, newest first.
    ///
    /// `since` limits the listing to runs created at or after that instant.
    async fn list_completed_runs(
        &self,
        owner: &str,
        repo: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkflowRun>, ScmError>;

    /// List the jobs of one run.
    async fn list_jobs(&self, owner: &str, repo: &str, run_id: u64)
        -> Result<Vec<WorkflowJob>, ScmError>;

    /// Download the plain-text log of one job.
    async fn job_logs(&self, owner: &str, repo: &str, job_id: u64) -> Result<String, ScmError>;
}
