//! In-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AttemptCounts, Store, StoreError};
use crate::ci::types::{Build, BuildFailure, FixAttempt, FixStatus};

#[derive(Default)]
struct Inner {
    builds: HashMap<u64, Build>,
    failures: HashMap<Uuid, BuildFailure>,
    attempts: HashMap<Uuid, FixAttempt>,
    attempts_by_task: HashMap<String, Uuid>,
}

/// Process-local store. All state is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_build(&self, build: &Build) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .builds
            .get(&build.run_id)
            .is_some_and(|existing| existing.status.is_terminal())
        {
            return Ok(false);
        }
        inner.builds.insert(build.run_id, build.clone());
        Ok(true)
    }

    async fn get_build_by_run(&self, run_id: u64) -> Result<Option<Build>, StoreError> {
        Ok(self.inner.read().await.builds.get(&run_id).cloned())
    }

    async fn insert_failure(&self, failure: &BuildFailure) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .failures
            .entry(failure.id)
            .or_insert_with(|| failure.clone());
        Ok(())
    }

    async fn get_failure(&self, id: Uuid) -> Result<Option<BuildFailure>, StoreError> {
        Ok(self.inner.read().await.failures.get(&id).cloned())
    }

    async fn insert_attempt(&self, attempt: &FixAttempt) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.attempts_by_task.contains_key(&attempt.task_id) {
            return Err(StoreError::Conflict(format!("task id {}", attempt.task_id)));
        }
        inner
            .attempts_by_task
            .insert(attempt.task_id.clone(), attempt.id);
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<FixAttempt>, StoreError> {
        Ok(self.inner.read().await.attempts.get(&id).cloned())
    }

    async fn find_attempt_by_task(&self, task_id: &str) -> Result<Option<FixAttempt>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts_by_task
            .get(task_id)
            .and_then(|id| inner.attempts.get(id))
            .cloned())
    }

    async fn claim_completion(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(attempt) = inner.attempts.get_mut(&id) else {
            return Ok(false);
        };
        if attempt.is_terminal() {
            return Ok(false);
        }
        if attempt
            .completion_claimed_at
            .is_some_and(|claimed| claimed >= stale_before)
        {
            return Ok(false);
        }
        attempt.completion_claimed_at = Some(now);
        Ok(true)
    }

    async fn release_claim(&self, id: Uuid, claimed_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.attempts.get_mut(&id) {
            Some(stored)
                if !stored.is_terminal() && stored.completion_claimed_at == Some(claimed_at) =>
            {
                stored.completion_claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_attempt(&self, attempt: &FixAttempt) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.attempts.get_mut(&attempt.id) {
            Some(stored) if !stored.is_terminal() => {
                *stored = attempt.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attempt_counts(&self) -> Result<AttemptCounts, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = AttemptCounts::default();
        for attempt in inner.attempts.values() {
            match attempt.status {
                FixStatus::InProgress => counts.in_progress += 1,
                FixStatus::Succeeded => counts.succeeded += 1,
                FixStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
