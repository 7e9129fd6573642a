//! CI build poller.
//!
//! Polls the CI provider for completed workflow runs, records them as
//! [`Build`]s and hands each new failed run to the orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use scm::{CiProvider, ScmError, WorkflowJob, WorkflowRun};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ci::sanitize::{strip_control, tail_chars, truncate_chars};
use crate::ci::types::{Build, BuildFailure, RepositoryName};
use crate::ci::FixOrchestrator;
use crate::retry::RetryPolicy;

/// Failed jobs whose logs are inspected per run.
const MAX_JOBS_INSPECTED: usize = 3;

/// Longest single error line kept.
const MAX_LINE_CHARS: usize = 500;

/// GitHub Actions timestamp prefix on every log line.
static LOG_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z\s?").unwrap()
});

/// Lines that look like an error report.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|errors|failed|failure|exception|fatal|panicked|timed out|traceback)\b")
        .unwrap()
});

/// Configuration for the build poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Repositories to monitor (e.g., "acme/widgets")
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Only runs created within this window are considered (minutes)
    #[serde(default = "default_lookback")]
    pub lookback_mins: u64,
    /// Branches to monitor (empty = all)
    #[serde(default)]
    pub branches: Vec<String>,
    /// Workflows to exclude (substring match)
    #[serde(default)]
    pub excluded_workflows: Vec<String>,
    /// Maximum failed runs dispatched per poll
    #[serde(default = "default_max_per_poll")]
    pub max_per_poll: usize,
    /// Error lines kept per failed job
    #[serde(default = "default_max_error_lines")]
    pub max_error_lines: usize,
    /// Log tail attached to a failure
    #[serde(default = "default_max_log_chars")]
    pub max_log_chars: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_lookback() -> u64 {
    60
}
fn default_max_per_poll() -> usize {
    10
}
fn default_max_error_lines() -> usize {
    20
}
fn default_max_log_chars() -> usize {
    20_000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            repositories: vec![],
            poll_interval_secs: default_poll_interval(),
            lookback_mins: default_lookback(),
            branches: vec![],
            excluded_workflows: vec![],
            max_per_poll: default_max_per_poll(),
            max_error_lines: default_max_error_lines(),
            max_log_chars: default_max_log_chars(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PollerConfig {
    fn branch_allowed(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }

    fn workflow_excluded(&self, workflow: &str) -> bool {
        self.excluded_workflows.iter().any(|w| workflow.contains(w.as_str()))
    }
}

/// Totals for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub runs_seen: usize,
    pub builds_recorded: usize,
    pub failures_dispatched: usize,
    pub attempts_created: usize,
    pub dispatch_errors: usize,
    /// Builds that could not be written; a dispatched one may be dispatched
    /// again on the next poll
    pub record_errors: usize,
    pub repositories_failed: usize,
}

/// Polls CI for failed builds and feeds the orchestrator.
pub struct BuildPoller {
    config: PollerConfig,
    provider: Arc<dyn CiProvider>,
    orchestrator: Arc<FixOrchestrator>,
    last_poll: Option<DateTime<Utc>>,
}

impl BuildPoller {
    #[must_use]
    pub fn new(
        config: PollerConfig,
        provider: Arc<dyn CiProvider>,
        orchestrator: Arc<FixOrchestrator>,
    ) -> Self {
        Self {
            config,
            provider,
            orchestrator,
            last_poll: None,
        }
    }

    #[must_use]
    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        self.last_poll
    }

    /// Poll until `shutdown` fires. Poll errors are logged, never fatal.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            repositories = self.config.repositories.len(),
            interval_secs = self.config.poll_interval_secs,
            provider = self.provider.name(),
            "Build poller started"
        );

        loop {
            match self.poll_once().await {
                Ok(summary) => debug!(?summary, "Poll complete"),
                Err(e) => error!("Build poll failed: {e}"),
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Build poller stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
            }
        }
    }

    /// Perform a single poll cycle over every configured repository.
    ///
    /// Fails only when every repository failed to poll.
    pub async fn poll_once(&mut self) -> Result<PollSummary> {
        let started = Utc::now();
        let since = started
            - chrono::Duration::minutes(i64::try_from(self.config.lookback_mins).unwrap_or(60));
        let mut summary = PollSummary::default();
        let mut budget = self.config.max_per_poll;

        let repositories = self.config.repositories.clone();
        for repository in &repositories {
            let parsed = match RepositoryName::parse(repository) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("Skipping configured repository: {e}");
                    summary.repositories_failed += 1;
                    continue;
                }
            };

            if let Err(e) = self
                .poll_repository(&parsed, since, &mut budget, &mut summary)
                .await
            {
                error!(repository = %parsed, kind = e.kind(), "Error polling repository: {e}");
                summary.repositories_failed += 1;
            }
        }

        self.last_poll = Some(started);

        if !repositories.is_empty() && summary.repositories_failed == repositories.len() {
            bail!("All {} repositories failed to poll", repositories.len());
        }
        if summary.failures_dispatched > 0 {
            info!(
                dispatched = summary.failures_dispatched,
                attempts = summary.attempts_created,
                errors = summary.dispatch_errors,
                "Dispatched build failures"
            );
        }
        if summary.record_errors > 0 {
            warn!(record_errors = summary.record_errors, "Some builds were not recorded");
        }
        Ok(summary)
    }

    async fn poll_repository(
        &self,
        repository: &RepositoryName,
        since: DateTime<Utc>,
        budget: &mut usize,
        summary: &mut PollSummary,
    ) -> Result<(), ScmError> {
        debug!(repository = %repository, "Polling repository");
        let provider = &self.provider;
        let runs = self
            .config
            .retry
            .execute("list completed runs", move || {
                provider.list_completed_runs(&repository.owner, &repository.name, Some(since))
            })
            .await?;

        let store = self.orchestrator.store();
        let mut seen = HashSet::new();

        for run in runs {
            if !seen.insert(run.id) {
                continue;
            }
            summary.runs_seen += 1;

            if run.created_at < since
                || !self.config.branch_allowed(&run.head_branch)
                || self.config.workflow_excluded(&run.workflow_name)
            {
                continue;
            }

            let existing = match store.get_build_by_run(run.id).await {
                Ok(existing) => existing,
                Err(e) => {
                    error!(run_id = run.id, error = %e, "Failed to read build");
                    continue;
                }
            };
            if existing.as_ref().is_some_and(|b| b.status.is_terminal()) {
                continue;
            }

            let mut build = match existing {
                Some(mut build) => {
                    build.apply_run(&run);
                    build
                }
                None => Build::from_run(&run),
            };

            let mut dispatched = false;
            if run.is_failed() {
                if *budget == 0 {
                    debug!(run_id = run.id, "Per-poll limit reached, deferring run");
                    continue;
                }
                *budget -= 1;

                // The build is recorded only after a successful dispatch, so
                // a failed dispatch is retried on the next poll.
                dispatched = true;
                match self.dispatch_run(&run, &mut build).await {
                    Ok(created) => {
                        summary.failures_dispatched += 1;
                        if created {
                            summary.attempts_created += 1;
                        }
                    }
                    Err(e) => {
                        summary.dispatch_errors += 1;
                        error!(run_id = run.id, repository = %repository, "Failed to dispatch build failure: {e}");
                        continue;
                    }
                }
            }

            match store.upsert_build(&build).await {
                Ok(true) => summary.builds_recorded += 1,
                Ok(false) => debug!(run_id = run.id, "Build already terminal"),
                Err(e) => {
                    summary.record_errors += 1;
                    if dispatched {
                        error!(
                            run_id = run.id,
                            repository = %repository,
                            error = %e,
                            "Failed to record dispatched build; the run may be dispatched again next poll"
                        );
                    } else {
                        warn!(run_id = run.id, error = %e, "Failed to record build");
                    }
                }
            }
        }

        Ok(())
    }

    /// Build the failure record for a failed run and hand it to the
    /// orchestrator. Returns whether a fix attempt was created.
    async fn dispatch_run(&self, run: &WorkflowRun, build: &mut Build) -> Result<bool> {
        let (failure, error_lines) = self.collect_failure(run, build).await?;
        build.error_messages = error_lines;

        info!(
            run_id = run.id,
            repository = %failure.repository,
            job = failure.job_name.as_deref().unwrap_or("-"),
            "Build failure detected"
        );
        let attempt = self.orchestrator.process_build_failure(failure).await?;
        Ok(attempt.is_some())
    }

    /// Pick the most useful failed job: the first whose log contains a
    /// classifiable error line, else the first failed job.
    async fn collect_failure(
        &self,
        run: &WorkflowRun,
        build: &Build,
    ) -> Result<(BuildFailure, Vec<String>), ScmError> {
        let provider = &self.provider;
        let jobs = self
            .config
            .retry
            .execute("list jobs", move || provider.list_jobs(&run.owner, &run.repository, run.id))
            .await?;

        let classifier = self.orchestrator.classifier();
        let mut fallback: Option<(&WorkflowJob, Vec<String>, String)> = None;

        for job in jobs.iter().filter(|j| j.is_failed()).take(MAX_JOBS_INSPECTED) {
            let logs = match self
                .config
                .retry
                .execute("job logs", move || provider.job_logs(&run.owner, &run.repository, job.id))
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(job_id = job.id, kind = e.kind(), "Could not fetch job logs");
                    String::new()
                }
            };
            let lines = extract_error_lines(&logs, self.config.max_error_lines);

            if let Some(line) = lines.iter().find(|l| classifier.should_attempt_fix(l)) {
                let failure = self.failure_for(run, build, line, Some(job), &logs);
                return Ok((failure, lines));
            }
            if fallback.is_none() {
                fallback = Some((job, lines, logs));
            }
        }

        let (failure, lines) = match fallback {
            Some((job, lines, logs)) => {
                let message = lines
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("Job '{}' failed", job.name));
                (self.failure_for(run, build, &message, Some(job), &logs), lines)
            }
            None => {
                let message = format!(
                    "Workflow '{}' concluded with {}",
                    run.workflow_name,
                    run.conclusion.as_deref().unwrap_or("failure")
                );
                (self.failure_for(run, build, &message, None, ""), vec![])
            }
        };
        Ok((failure, lines))
    }

    fn failure_for(
        &self,
        run: &WorkflowRun,
        build: &Build,
        message: &str,
        job: Option<&WorkflowJob>,
        logs: &str,
    ) -> BuildFailure {
        let mut failure = BuildFailure::new(build.repository.clone(), message).with_build(build);
        if let Some(job) = job {
            failure = failure.with_job(job.name.clone());
        }
        if !logs.trim().is_empty() {
            failure = failure.with_log(tail_chars(logs, self.config.max_log_chars));
        }
        failure.failed_at = run.updated_at;
        failure
    }
}

/// Pull error-looking lines out of a CI log, in order and without repeats.
#[must_use]
pub fn extract_error_lines(logs: &str, max_lines: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for raw in logs.lines() {
        if lines.len() >= max_lines {
            break;
        }
        let line = strip_control(raw);
        let line = LOG_TIMESTAMP.replace(&line, "");
        let line = line.trim_start_matches("##[error]").trim();
        if line.is_empty() || line.starts_with("##[") || !ERROR_LINE.is_match(line) {
            continue;
        }
        let line = truncate_chars(line, MAX_LINE_CHARS);
        if seen.insert(line.clone()) {
            lines.push(line);
        }
    }

    lines
}
