//! Shared fixtures for orchestrator and consumer tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use notify::{FixEvent, MemoryChannel, Notifier};
use scm::{NewPullRequest, PullRequest, Repository, ScmError, SourceHost};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::classifier::ErrorClassifier;
use super::executor::{ExecutorError, TaskExecutor, TaskInfo, TaskRequest};
use super::orchestrator::{FixOrchestrator, OrchestratorSettings};
use super::types::{Build, BuildFailure, FixAttempt};
use crate::store::{AttemptCounts, MemoryStore, Store, StoreError};

mock! {
    pub Executor {}

    #[async_trait]
    impl TaskExecutor for Executor {
        fn name(&self) -> &'static str;
        async fn create_task(&self, request: &TaskRequest) -> Result<TaskInfo, ExecutorError>;
    }
}

mock! {
    pub Host {}

    #[async_trait]
    impl SourceHost for Host {
        fn name(&self) -> &'static str;
        async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest, ScmError>;
        async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError>;
    }
}

/// [`MemoryStore`] whose selected operations fail a set number of times
/// before delegating.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub upsert_build_errors: AtomicUsize,
    pub get_failure_errors: AtomicUsize,
    pub finalize_errors: AtomicUsize,
}

impl FlakyStore {
    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn upsert_build(&self, build: &Build) -> Result<bool, StoreError> {
        Self::trip(&self.upsert_build_errors)?;
        self.inner.upsert_build(build).await
    }

    async fn get_build_by_run(&self, run_id: u64) -> Result<Option<Build>, StoreError> {
        self.inner.get_build_by_run(run_id).await
    }

    async fn insert_failure(&self, failure: &BuildFailure) -> Result<(), StoreError> {
        self.inner.insert_failure(failure).await
    }

    async fn get_failure(&self, id: Uuid) -> Result<Option<BuildFailure>, StoreError> {
        Self::trip(&self.get_failure_errors)?;
        self.inner.get_failure(id).await
    }

    async fn insert_attempt(&self, attempt: &FixAttempt) -> Result<(), StoreError> {
        self.inner.insert_attempt(attempt).await
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<FixAttempt>, StoreError> {
        self.inner.get_attempt(id).await
    }

    async fn find_attempt_by_task(&self, task_id: &str) -> Result<Option<FixAttempt>, StoreError> {
        self.inner.find_attempt_by_task(task_id).await
    }

    async fn claim_completion(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.claim_completion(id, now, stale_before).await
    }

    async fn release_claim(&self, id: Uuid, claimed_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.release_claim(id, claimed_at).await
    }

    async fn finalize_attempt(&self, attempt: &FixAttempt) -> Result<bool, StoreError> {
        Self::trip(&self.finalize_errors)?;
        self.inner.finalize_attempt(attempt).await
    }

    async fn attempt_counts(&self) -> Result<AttemptCounts, StoreError> {
        self.inner.attempt_counts().await
    }
}

pub struct Harness {
    pub orchestrator: FixOrchestrator,
    pub store: Arc<MemoryStore>,
    pub events: broadcast::Receiver<FixEvent>,
}

/// Orchestrator over an in-memory store with a subscribed event channel.
pub fn harness(executor: MockExecutor, host: MockHost) -> Harness {
    let store = Arc::new(MemoryStore::new());
    build_harness(executor, host, store.clone(), store)
}

/// Like [`harness`], with the orchestrator writing through `flaky`.
/// `Harness::store` is the underlying memory store.
pub fn flaky_harness(executor: MockExecutor, host: MockHost, flaky: FlakyStore) -> Harness {
    let store = flaky.inner.clone();
    build_harness(executor, host, Arc::new(flaky), store)
}

fn build_harness(
    executor: MockExecutor,
    host: MockHost,
    backend: Arc<dyn Store>,
    store: Arc<MemoryStore>,
) -> Harness {
    let channel = Arc::new(MemoryChannel::default());
    let events = channel.subscribe();
    let notifier = Notifier::with_channels(vec![channel]);

    let orchestrator = FixOrchestrator::new(
        Arc::new(ErrorClassifier::with_default_patterns()),
        backend,
        Arc::new(executor),
        Arc::new(host),
        Arc::new(notifier),
        OrchestratorSettings::default(),
    );

    Harness {
        orchestrator,
        store,
        events,
    }
}
