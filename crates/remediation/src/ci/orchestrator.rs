//! Build-failure intake.
//!
//! Classifies a failure, records it, asks the task service for a fix and
//! records the resulting [`FixAttempt`]. Completion of that task is handled in
//! [`super::completion`].

use std::sync::Arc;

use chrono::Utc;
use notify::{FixEvent, Notifier};
use scm::SourceHost;
use tracing::{error, info, warn};

use super::classifier::ErrorClassifier;
use super::error::PipelineError;
use super::executor::{TaskExecutor, TaskRequest};
use super::sanitize::{indent_block, safe_inline, safe_tail, safe_text};
use super::types::{BuildFailure, FixAttempt};
use crate::config::{PullRequestConfig, RemediationConfig, TextLimits};
use crate::store::Store;

/// Cap for single-line metadata fields embedded in descriptions.
const METADATA_CHARS: usize = 200;

/// Orchestrator knobs taken from [`RemediationConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub limits: TextLimits,
    pub pull_request: PullRequestConfig,
}

impl From<&RemediationConfig> for OrchestratorSettings {
    fn from(config: &RemediationConfig) -> Self {
        Self {
            limits: config.limits,
            pull_request: config.pull_request.clone(),
        }
    }
}

/// Drives a build failure from classification to an opened pull request.
///
/// Holds no mutable state of its own; every call is safe to run
/// concurrently with any other.
pub struct FixOrchestrator {
    pub(super) classifier: Arc<ErrorClassifier>,
    pub(super) store: Arc<dyn Store>,
    pub(super) executor: Arc<dyn TaskExecutor>,
    pub(super) source_host: Arc<dyn SourceHost>,
    pub(super) notifier: Arc<Notifier>,
    pub(super) settings: OrchestratorSettings,
}

impl FixOrchestrator {
    #[must_use]
    pub fn new(
        classifier: Arc<ErrorClassifier>,
        store: Arc<dyn Store>,
        executor: Arc<dyn TaskExecutor>,
        source_host: Arc<dyn SourceHost>,
        notifier: Arc<Notifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            classifier,
            store,
            executor,
            source_host,
            notifier,
            settings,
        }
    }

    #[must_use]
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Handle one build failure.
    ///
    /// Returns `Ok(None)` when the error is not a recognized category; nothing
    /// is persisted or published in that case. When task creation fails the
    /// failure record stays persisted but no attempt is created.
    pub async fn process_build_failure(
        &self,
        failure: BuildFailure,
    ) -> Result<Option<FixAttempt>, PipelineError> {
        let Some(pattern) = self.classifier.extract_error_pattern(&failure.error_message) else {
            info!(
                failure_id = %failure.id,
                repository = %failure.repository,
                "Unrecognized error, no fix attempted"
            );
            return Ok(None);
        };

        // Idempotent on the failure id, so a redelivery after a task-service
        // error gets to retry task creation.
        let failure = failure.with_error_pattern(Some(pattern.clone()));
        self.store.insert_failure(&failure).await?;

        let request = self.task_request(&failure);
        let task = match self.executor.create_task(&request).await {
            Ok(task) => task,
            Err(e) => {
                error!(
                    failure_id = %failure.id,
                    repository = %failure.repository,
                    executor = self.executor.name(),
                    kind = e.kind(),
                    error = %e,
                    "Failed to create fix task"
                );
                return Err(e.into());
            }
        };

        let attempt = FixAttempt::new(&failure, task.id.clone());
        self.store.insert_attempt(&attempt).await?;

        info!(
            attempt_id = %attempt.id,
            task_id = %attempt.task_id,
            repository = %attempt.repository,
            pattern = %pattern,
            task_kind = ?task.kind,
            complexity = ?task.complexity,
            "Fix attempt started"
        );

        self.publish(FixEvent::FixAttempted {
            fix_attempt_id: attempt.id.to_string(),
            build_id: failure
                .build_id
                .map_or_else(|| failure.id.to_string(), |id| id.to_string()),
            task_id: attempt.task_id.clone(),
            repository: attempt.repository.clone(),
            error_message: safe_text(&failure.error_message, self.settings.limits.error_message_chars),
            error_pattern: Some(pattern),
            timestamp: Utc::now(),
        })
        .await;

        Ok(Some(attempt))
    }

    /// Task title and description for a classified failure.
    ///
    /// Every externally sourced string is sanitized and capped; multi-line
    /// content is embedded as indented code blocks.
    pub(crate) fn task_request(&self, failure: &BuildFailure) -> TaskRequest {
        let limits = &self.settings.limits;
        let pattern = failure.error_pattern.as_deref().unwrap_or("unclassified");
        let repository = safe_inline(&failure.repository, METADATA_CHARS);
        let inline = |value: &str| {
            let value = safe_inline(value, METADATA_CHARS);
            if value.is_empty() {
                "n/a".to_string()
            } else {
                value
            }
        };

        let mut description = format!(
            "## CI build failure\n\n\
             - Repository: {repository}\n\
             - Branch: {branch}\n\
             - Commit: {commit}\n\
             - Workflow: {workflow}\n\
             - Job: {job}\n\
             - Error category: {pattern}\n\n\
             ### Error\n\n{message}\n",
            branch = inline(&failure.branch),
            commit = inline(&failure.commit_sha),
            workflow = inline(&failure.workflow_name),
            job = inline(failure.job_name.as_deref().unwrap_or_default()),
            message = indent_block(&safe_text(&failure.error_message, limits.error_message_chars)),
        );

        if let Some(log) = failure.error_log.as_deref().filter(|l| !l.trim().is_empty()) {
            description.push_str("\n### Log excerpt\n\n");
            description.push_str(&indent_block(&safe_tail(log, limits.error_log_chars)));
            description.push('\n');
        }

        description.push_str(
            "\nFix the root cause of this failure and keep the change minimal. \
             Do not disable or skip the failing check.\n",
        );

        TaskRequest {
            title: format!("Fix {pattern} in {repository}"),
            description,
        }
    }

    /// Publish to the event bus. Delivery failures are logged, never raised.
    pub(super) async fn publish(&self, event: FixEvent) {
        let key = event.routing_key();
        let results = self.notifier.notify_and_wait(event).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!(key, failed, "Event not delivered to every channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::executor::{ExecutorError, TaskComplexity, TaskInfo, TaskKind};
    use crate::ci::test_support::{harness, MockExecutor, MockHost};

    fn task(id: &str) -> TaskInfo {
        TaskInfo {
            id: id.to_string(),
            status: "pending".into(),
            kind: TaskKind::BugFix,
            complexity: TaskComplexity::Simple,
            created_at: None,
        }
    }

    fn failure(message: &str) -> BuildFailure {
        BuildFailure::new("acme/widgets", message)
            .with_branch("main")
            .with_commit("abc123")
            .with_workflow("CI")
            .with_job("build")
    }

    #[tokio::test]
    async fn test_classified_failure_creates_attempt() {
        let mut executor = MockExecutor::new();
        executor.expect_name().return_const("mock");
        executor
            .expect_create_task()
            .withf(|req| req.title == "Fix compilation_error in acme/widgets")
            .times(1)
            .returning(|_| Ok(task("T1")));

        let mut h = harness(executor, MockHost::new());
        let input = failure("error CS1002: ; expected");
        let failure_id = input.id;

        let attempt = h
            .orchestrator
            .process_build_failure(input)
            .await
            .unwrap()
            .expect("attempt");

        assert_eq!(attempt.task_id, "T1");
        assert_eq!(attempt.error_pattern.as_deref(), Some("compilation_error"));
        assert_eq!(attempt.build_failure_id, failure_id);

        let stored_failure = h.store.get_failure(failure_id).await.unwrap().unwrap();
        assert_eq!(stored_failure.error_pattern.as_deref(), Some("compilation_error"));
        let stored = h.store.find_attempt_by_task("T1").await.unwrap().unwrap();
        assert_eq!(stored.id, attempt.id);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.routing_key(), "fix.attempted");
        assert_eq!(event.fix_attempt_id(), attempt.id.to_string());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_failure_is_ignored() {
        let mut executor = MockExecutor::new();
        executor.expect_create_task().times(0);

        let mut h = harness(executor, MockHost::new());
        let input = failure("disk quota exceeded");
        let failure_id = input.id;

        let result = h.orchestrator.process_build_failure(input).await.unwrap();
        assert!(result.is_none());
        assert!(h.store.get_failure(failure_id).await.unwrap().is_none());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_creation_failure_propagates() {
        let mut executor = MockExecutor::new();
        executor.expect_name().return_const("mock");
        executor
            .expect_create_task()
            .returning(|_| Err(ExecutorError::Rejected { status: 500 }));

        let mut h = harness(executor, MockHost::new());
        let input = failure("error CS1002: ; expected");
        let failure_id = input.id;

        let err = h.orchestrator.process_build_failure(input).await.unwrap_err();
        assert!(matches!(err, PipelineError::TaskCreation(_)));
        assert!(err.is_retryable());

        assert!(h.store.get_failure(failure_id).await.unwrap().is_some());
        assert_eq!(h.store.attempt_counts().await.unwrap().in_progress, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_redelivered_failure_retries_task_creation() {
        let mut executor = MockExecutor::new();
        executor.expect_name().return_const("mock");
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        executor.expect_create_task().returning(move |_| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(ExecutorError::Rejected { status: 503 })
            } else {
                Ok(task("T-redelivered"))
            }
        });

        let mut h = harness(executor, MockHost::new());
        let input = failure("error CS1002: ; expected");

        let err = h
            .orchestrator
            .process_build_failure(input.clone())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let attempt = h
            .orchestrator
            .process_build_failure(input.clone())
            .await
            .unwrap()
            .expect("attempt");
        assert_eq!(attempt.build_failure_id, input.id);
        assert_eq!(attempt.error_message, "error CS1002: ; expected");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(h.store.attempt_counts().await.unwrap().in_progress, 1);
        assert_eq!(h.events.try_recv().unwrap().routing_key(), "fix.attempted");
    }

    #[tokio::test]
    async fn test_description_is_sanitized_and_capped() {
        let h = harness(MockExecutor::new(), MockHost::new());
        let message = format!("error CS1002: ```\x1b[31m{}", "x".repeat(5000));
        let input = failure(&message)
            .with_log(format!("{}\nfinal error line ```", "noise\n".repeat(2000)))
            .with_error_pattern(Some("compilation_error".into()));

        let request = h.orchestrator.task_request(&input);
        assert!(!request.description.contains("```"));
        assert!(!request.description.contains('\x1b'));
        assert!(request.description.contains("final error line"));
        assert!(request.description.contains("- Branch: main"));
        assert!(request.description.chars().count() < 12_000);
    }

    #[tokio::test]
    async fn test_missing_metadata_rendered_as_na() {
        let h = harness(MockExecutor::new(), MockHost::new());
        let input = BuildFailure::new("acme/widgets", "syntax error");
        let request = h.orchestrator.task_request(&input);
        assert!(request.description.contains("- Job: n/a"));
        assert!(!request.description.contains("### Log excerpt"));
        assert_eq!(request.title, "Fix unclassified in acme/widgets");
    }
}
