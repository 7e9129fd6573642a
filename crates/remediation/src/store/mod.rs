//! Persistence for builds, build failures and fix attempts.
//!
//! [`Store`] is the seam the orchestrator, completion handler and poller
//! share. [`MemoryStore`] backs tests and single-process runs;
//! [`SqliteStore`] is the durable backend.

pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::ci::types::{Build, BuildFailure, FixAttempt};
use crate::config::StoreConfig;
use migrations::MigrationError;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    /// A unique key (task id, run id) is already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be mapped back to a record
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

/// Fix attempt totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptCounts {
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Durable record keeping.
///
/// Implementations must make [`Store::claim_completion`] and
/// [`Store::finalize_attempt`] atomic compare-and-swap operations; they are
/// what keeps duplicate completion deliveries from opening two pull requests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or refresh a build keyed by provider run id.
    ///
    /// Returns `false` without writing when the stored build is terminal.
    async fn upsert_build(&self, build: &Build) -> Result<bool, StoreError>;

    async fn get_build_by_run(&self, run_id: u64) -> Result<Option<Build>, StoreError>;

    /// Record a build failure. Inserting an id that already exists is a
    /// no-op, so redelivered failures can be persisted again.
    async fn insert_failure(&self, failure: &BuildFailure) -> Result<(), StoreError>;

    async fn get_failure(&self, id: Uuid) -> Result<Option<BuildFailure>, StoreError>;

    /// Insert a new attempt. Task ids are unique.
    async fn insert_attempt(&self, attempt: &FixAttempt) -> Result<(), StoreError>;

    async fn get_attempt(&self, id: Uuid) -> Result<Option<FixAttempt>, StoreError>;

    async fn find_attempt_by_task(&self, task_id: &str) -> Result<Option<FixAttempt>, StoreError>;

    /// Take ownership of pull-request creation for an in-progress attempt.
    ///
    /// Succeeds when the attempt is unclaimed or its claim is older than
    /// `stale_before`. Returns `false` when another delivery holds it or the
    /// attempt is already terminal.
    async fn claim_completion(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop a claim taken at `claimed_at` so a redelivery can retry.
    ///
    /// Returns `false` when the claim was retaken or the attempt is terminal.
    async fn release_claim(&self, id: Uuid, claimed_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Persist a terminal attempt, only if the stored one is still in progress.
    ///
    /// Returns `false` when another writer already finalized it.
    async fn finalize_attempt(&self, attempt: &FixAttempt) -> Result<bool, StoreError>;

    async fn attempt_counts(&self) -> Result<AttemptCounts, StoreError>;
}

/// Open the configured backend. An empty URL selects the in-memory store.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.database_url.as_deref() {
        None | Some("") => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Some(url) => {
            let store = SqliteStore::connect(url, config.max_connections).await?;
            store.migrate().await?;
            info!(url = %url, "Using SQLite store");
            Ok(Arc::new(store))
        }
    }
}
