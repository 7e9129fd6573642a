//! Task completion handling: open the fix pull request or record the failure.
//!
//! Completion messages may be delivered more than once and concurrently.
//! Pull-request creation is guarded by a completion claim taken in the store
//! (at most one delivery proceeds) and the terminal write is a
//! compare-and-swap on the in-progress status, so an attempt is finalized and
//! announced exactly once. A delivery that fails before the pull request
//! exists releases its claim so a redelivery can finish the attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::FixEvent;
use scm::{NewPullRequest, PullRequest};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::PipelineError;
use super::orchestrator::FixOrchestrator;
use super::sanitize::{indent_block, safe_inline, safe_text};
use super::types::{FixAttempt, FixStatus, RepositoryName};

/// Reason recorded when the task service reports failure.
pub const TASK_EXECUTION_FAILED: &str = "Task execution failed";

/// Reason recorded when the stored repository is malformed.
pub const INVALID_REPOSITORY: &str = "Invalid repository identifier";

/// Extra finalize attempts once a pull request is open.
const FINALIZE_RETRIES: u32 = 3;

const FINALIZE_BACKOFF: Duration = Duration::from_millis(50);

/// What a completion delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// No attempt tracks this task id
    UnknownTask,
    /// The attempt was already terminal; nothing changed
    AlreadyFinalized(FixStatus),
    /// Another delivery owns (or finished) this completion
    Duplicate,
    /// Pull request opened
    Succeeded { number: u64, url: String },
    /// Attempt marked failed
    Failed { reason: String },
}

impl FixOrchestrator {
    /// Handle a task-completion notification.
    ///
    /// Returns an error only for storage failures and for attempts whose
    /// stored repository is malformed (which are marked failed first).
    pub async fn process_task_completion(
        &self,
        task_id: &str,
        success: bool,
    ) -> Result<CompletionOutcome, PipelineError> {
        let Some(attempt) = self.store.find_attempt_by_task(task_id).await? else {
            warn!(task_id = %task_id, "Completion for unknown task");
            return Ok(CompletionOutcome::UnknownTask);
        };

        if attempt.is_terminal() {
            info!(
                attempt_id = %attempt.id,
                task_id = %task_id,
                status = %attempt.status,
                "Duplicate completion ignored"
            );
            return Ok(CompletionOutcome::AlreadyFinalized(attempt.status));
        }

        if !success {
            return self.fail_attempt(attempt, TASK_EXECUTION_FAILED).await;
        }

        let repository = match RepositoryName::parse(&attempt.repository) {
            Ok(repository) => repository,
            Err(e) => {
                error!(
                    attempt_id = %attempt.id,
                    repository = %attempt.repository,
                    "Stored repository identifier is malformed"
                );
                self.fail_attempt(attempt, INVALID_REPOSITORY).await?;
                return Err(e);
            }
        };

        // Everything that can fail before the pull request exists runs
        // unclaimed, so an error here leaves the delivery retryable.
        let request = self.pull_request_for(&attempt, &repository).await?;

        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.settings.pull_request.claim_ttl())
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        if !self.store.claim_completion(attempt.id, now, stale_before).await? {
            info!(attempt_id = %attempt.id, task_id = %task_id, "Completion already claimed");
            return Ok(CompletionOutcome::Duplicate);
        }

        let mut attempt = attempt;
        attempt.completion_claimed_at = Some(now);

        match self.source_host.create_pull_request(&request).await {
            Ok(pr) => self.record_pull_request(attempt, &repository, pr).await,
            Err(e) => {
                warn!(
                    attempt_id = %attempt.id,
                    provider = self.source_host.name(),
                    kind = e.kind(),
                    error = %e,
                    "Pull request creation failed"
                );
                let attempt_id = attempt.id;
                let result = self.fail_attempt(attempt, e.kind()).await;
                if result.is_err() {
                    self.release_completion_claim(attempt_id, now).await;
                }
                result
            }
        }
    }

    /// Finalize an attempt whose pull request is already open.
    ///
    /// Store errors are retried here instead of releasing the claim: a
    /// released claim would let a redelivery open a second pull request.
    async fn record_pull_request(
        &self,
        mut attempt: FixAttempt,
        repository: &RepositoryName,
        pr: PullRequest,
    ) -> Result<CompletionOutcome, PipelineError> {
        attempt.mark_succeeded(pr.number, pr.html_url.clone())?;

        let mut retries = 0;
        let finalized = loop {
            match self.store.finalize_attempt(&attempt).await {
                Ok(finalized) => break finalized,
                Err(e) if retries < FINALIZE_RETRIES => {
                    retries += 1;
                    warn!(
                        attempt_id = %attempt.id,
                        pr_number = pr.number,
                        retry = retries,
                        error = %e,
                        "Failed to record opened pull request, retrying"
                    );
                    tokio::time::sleep(FINALIZE_BACKOFF * retries).await;
                }
                Err(e) => {
                    error!(
                        attempt_id = %attempt.id,
                        pr_number = pr.number,
                        pr_url = %pr.html_url,
                        error = %e,
                        "Pull request opened but not recorded; attempt stays claimed until the claim expires"
                    );
                    return Err(e.into());
                }
            }
        };

        if !finalized {
            warn!(
                attempt_id = %attempt.id,
                pr_number = pr.number,
                "Pull request opened but attempt was finalized elsewhere"
            );
            return Ok(CompletionOutcome::Duplicate);
        }

        info!(
            attempt_id = %attempt.id,
            repository = %repository,
            pr_number = pr.number,
            pr_url = %pr.html_url,
            "Fix pull request opened"
        );
        self.publish(FixEvent::FixSucceeded {
            fix_attempt_id: attempt.id.to_string(),
            task_id: attempt.task_id.clone(),
            pull_request_number: pr.number,
            pull_request_url: pr.html_url.clone(),
            repository: attempt.repository.clone(),
            error_pattern: attempt.error_pattern.clone(),
            timestamp: Utc::now(),
        })
        .await;

        Ok(CompletionOutcome::Succeeded {
            number: pr.number,
            url: pr.html_url,
        })
    }

    /// Give up a claim so the next delivery can take it immediately.
    async fn release_completion_claim(&self, attempt_id: Uuid, claimed_at: DateTime<Utc>) {
        match self.store.release_claim(attempt_id, claimed_at).await {
            Ok(true) => info!(attempt_id = %attempt_id, "Completion claim released"),
            Ok(false) => {}
            Err(e) => warn!(
                attempt_id = %attempt_id,
                error = %e,
                "Failed to release completion claim; it expires after the claim TTL"
            ),
        }
    }

    /// Mark `attempt` failed and announce it, unless another writer won.
    async fn fail_attempt(
        &self,
        mut attempt: FixAttempt,
        reason: &str,
    ) -> Result<CompletionOutcome, PipelineError> {
        attempt.mark_failed(reason)?;
        if !self.store.finalize_attempt(&attempt).await? {
            info!(attempt_id = %attempt.id, "Attempt finalized elsewhere");
            return Ok(CompletionOutcome::Duplicate);
        }

        info!(attempt_id = %attempt.id, task_id = %attempt.task_id, reason, "Fix attempt failed");
        self.publish(FixEvent::FixFailed {
            fix_attempt_id: attempt.id.to_string(),
            task_id: attempt.task_id.clone(),
            repository: attempt.repository.clone(),
            reason: reason.to_string(),
            error_pattern: attempt.error_pattern.clone(),
            timestamp: Utc::now(),
        })
        .await;

        Ok(CompletionOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    /// Pull request for a completed attempt.
    async fn pull_request_for(
        &self,
        attempt: &FixAttempt,
        repository: &RepositoryName,
    ) -> Result<NewPullRequest, PipelineError> {
        let failure = self.store.get_failure(attempt.build_failure_id).await?;
        let base = match failure.as_ref().map(|f| f.branch.trim()).filter(|b| !b.is_empty()) {
            Some(branch) => branch.to_string(),
            None => self.default_branch(repository).await,
        };

        let pattern = attempt.error_pattern.as_deref().unwrap_or("unclassified");
        let excerpt = failure.as_ref().map_or_else(String::new, |f| {
            safe_text(&f.error_message, self.settings.limits.pr_excerpt_chars)
        });

        let mut body = format!(
            "## Automated fix\n\n\
             This pull request was opened automatically to fix a failing CI build.\n\n\
             **Error category:** {pattern}\n"
        );
        if !excerpt.is_empty() {
            body.push_str("\n**Error excerpt:**\n\n");
            body.push_str(&indent_block(&excerpt));
            body.push('\n');
        }
        body.push_str(&format!(
            "\n---\nFix attempt: {}\nTask: {}\n",
            attempt.id,
            safe_inline(&attempt.task_id, 200)
        ));

        Ok(NewPullRequest {
            owner: repository.owner.clone(),
            repo: repository.name.clone(),
            title: format!("Automated fix: {pattern} in {}", repository.name),
            body,
            head: format!("{}{}", self.settings.pull_request.branch_prefix, attempt.id),
            base,
            draft: self.settings.pull_request.draft,
        })
    }

    /// Repository default branch, or the configured fallback.
    async fn default_branch(&self, repository: &RepositoryName) -> String {
        match self
            .source_host
            .get_repository(&repository.owner, &repository.name)
            .await
        {
            Ok(repo) if !repo.default_branch.trim().is_empty() => repo.default_branch,
            Ok(_) => self.settings.pull_request.fallback_base_branch.clone(),
            Err(e) => {
                warn!(
                    repository = %repository,
                    kind = e.kind(),
                    "Could not read default branch, using fallback"
                );
                self.settings.pull_request.fallback_base_branch.clone()
            }
        }
    }
}
