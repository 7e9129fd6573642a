//! SQLite store.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so they compare
//! correctly as text, which the completion claim relies on.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::migrations::{all_embedded_migrations, Migrator};
use super::{AttemptCounts, Store, StoreError};
use crate::ci::types::{Build, BuildFailure, BuildStatus, FixAttempt, FixStatus};

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url`, creating the file if missing.
    ///
    /// In-memory databases are pinned to a single long-lived connection so
    /// every query sees the same data.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|_| StoreError::InvalidUrl(database_url.to_string()))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(3));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Fresh migrated in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect("sqlite::memory:", 1).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Bring the schema up to date.
    pub async fn migrate(&self) -> Result<usize, StoreError> {
        Ok(Migrator::new(self.pool.clone())
            .run(&all_embedded_migrations())
            .await?)
    }
}

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {value:?}: {e}")))
}

fn parse_opt_ts(value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(parse_ts).transpose()
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("uuid {value:?}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_build(&self, build: &Build) -> Result<bool, StoreError> {
        let error_messages = serde_json::to_string(&build.error_messages)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r"INSERT INTO builds (id, run_id, repository, branch, commit_sha, workflow_name, status, conclusion, url, started_at, completed_at, error_messages, created_at, updated_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (run_id) DO UPDATE SET
                  status = excluded.status,
                  conclusion = excluded.conclusion,
                  started_at = excluded.started_at,
                  completed_at = excluded.completed_at,
                  error_messages = excluded.error_messages,
                  updated_at = excluded.updated_at
              WHERE builds.status NOT IN ('success', 'failure', 'cancelled')",
        )
        .bind(build.id.to_string())
        .bind(build.run_id as i64)
        .bind(&build.repository)
        .bind(&build.branch)
        .bind(&build.commit_sha)
        .bind(&build.workflow_name)
        .bind(build.status.as_str())
        .bind(&build.conclusion)
        .bind(&build.url)
        .bind(build.started_at.map(fmt_ts))
        .bind(build.completed_at.map(fmt_ts))
        .bind(error_messages)
        .bind(fmt_ts(build.created_at))
        .bind(fmt_ts(build.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_build_by_run(&self, run_id: u64) -> Result<Option<Build>, StoreError> {
        let row: Option<BuildRow> = sqlx::query_as("SELECT * FROM builds WHERE run_id = ?")
            .bind(run_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert_failure(&self, failure: &BuildFailure) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO build_failures (id, build_id, repository, branch, commit_sha, error_message, error_log, workflow_name, job_name, error_pattern, failed_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(failure.id.to_string())
        .bind(failure.build_id.map(|id| id.to_string()))
        .bind(&failure.repository)
        .bind(&failure.branch)
        .bind(&failure.commit_sha)
        .bind(&failure.error_message)
        .bind(&failure.error_log)
        .bind(&failure.workflow_name)
        .bind(&failure.job_name)
        .bind(&failure.error_pattern)
        .bind(fmt_ts(failure.failed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_failure(&self, id: Uuid) -> Result<Option<BuildFailure>, StoreError> {
        let row: Option<FailureRow> = sqlx::query_as("SELECT * FROM build_failures WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert_attempt(&self, attempt: &FixAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO fix_attempts (id, build_failure_id, task_id, repository, error_pattern, error_message, status, pull_request_number, pull_request_url, failure_reason, attempted_at, completed_at, completion_claimed_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id.to_string())
        .bind(attempt.build_failure_id.to_string())
        .bind(&attempt.task_id)
        .bind(&attempt.repository)
        .bind(&attempt.error_pattern)
        .bind(&attempt.error_message)
        .bind(attempt.status.as_str())
        .bind(attempt.pull_request_number.map(|n| n as i64))
        .bind(&attempt.pull_request_url)
        .bind(&attempt.failure_reason)
        .bind(fmt_ts(attempt.attempted_at))
        .bind(attempt.completed_at.map(fmt_ts))
        .bind(attempt.completion_claimed_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, || format!("task id {}", attempt.task_id)))?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<FixAttempt>, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as("SELECT * FROM fix_attempts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_attempt_by_task(&self, task_id: &str) -> Result<Option<FixAttempt>, StoreError> {
        let row: Option<AttemptRow> =
            sqlx::query_as("SELECT * FROM fix_attempts WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn claim_completion(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE fix_attempts SET completion_claimed_at = ?
              WHERE id = ? AND status = 'in_progress'
                AND (completion_claimed_at IS NULL OR completion_claimed_at < ?)",
        )
        .bind(fmt_ts(now))
        .bind(id.to_string())
        .bind(fmt_ts(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: Uuid, claimed_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE fix_attempts SET completion_claimed_at = NULL
              WHERE id = ? AND status = 'in_progress' AND completion_claimed_at = ?",
        )
        .bind(id.to_string())
        .bind(fmt_ts(claimed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize_attempt(&self, attempt: &FixAttempt) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE fix_attempts SET
                  status = ?,
                  pull_request_number = ?,
                  pull_request_url = ?,
                  failure_reason = ?,
                  completed_at = ?,
                  completion_claimed_at = ?
              WHERE id = ? AND status = 'in_progress'",
        )
        .bind(attempt.status.as_str())
        .bind(attempt.pull_request_number.map(|n| n as i64))
        .bind(&attempt.pull_request_url)
        .bind(&attempt.failure_reason)
        .bind(attempt.completed_at.map(fmt_ts))
        .bind(attempt.completion_claimed_at.map(fmt_ts))
        .bind(attempt.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn attempt_counts(&self) -> Result<AttemptCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM fix_attempts GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = AttemptCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            match FixStatus::from_str(&status).map_err(StoreError::Corrupt)? {
                FixStatus::InProgress => counts.in_progress = count,
                FixStatus::Succeeded => counts.succeeded = count,
                FixStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

/// Map unique-constraint violations to [`StoreError::Conflict`].
fn conflict_or(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what()),
        _ => StoreError::Database(err),
    }
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: String,
    run_id: i64,
    repository: String,
    branch: String,
    commit_sha: String,
    workflow_name: String,
    status: String,
    conclusion: Option<String>,
    url: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_messages: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<BuildRow> for Build {
    type Error = StoreError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            run_id: row.run_id as u64,
            repository: row.repository,
            branch: row.branch,
            commit_sha: row.commit_sha,
            workflow_name: row.workflow_name,
            status: BuildStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            conclusion: row.conclusion,
            url: row.url,
            started_at: parse_opt_ts(row.started_at.as_deref())?,
            completed_at: parse_opt_ts(row.completed_at.as_deref())?,
            error_messages: serde_json::from_str(&row.error_messages)
                .map_err(|e| StoreError::Corrupt(format!("error_messages: {e}")))?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: String,
    build_id: Option<String>,
    repository: String,
    branch: String,
    commit_sha: String,
    error_message: String,
    error_log: Option<String>,
    workflow_name: String,
    job_name: Option<String>,
    error_pattern: Option<String>,
    failed_at: String,
}

impl TryFrom<FailureRow> for BuildFailure {
    type Error = StoreError;

    fn try_from(row: FailureRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            build_id: row.build_id.as_deref().map(parse_uuid).transpose()?,
            repository: row.repository,
            branch: row.branch,
            commit_sha: row.commit_sha,
            error_message: row.error_message,
            error_log: row.error_log,
            workflow_name: row.workflow_name,
            job_name: row.job_name,
            error_pattern: row.error_pattern,
            failed_at: parse_ts(&row.failed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    build_failure_id: String,
    task_id: String,
    repository: String,
    error_pattern: Option<String>,
    error_message: String,
    status: String,
    pull_request_number: Option<i64>,
    pull_request_url: Option<String>,
    failure_reason: Option<String>,
    attempted_at: String,
    completed_at: Option<String>,
    completion_claimed_at: Option<String>,
}

impl TryFrom<AttemptRow> for FixAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            build_failure_id: parse_uuid(&row.build_failure_id)?,
            task_id: row.task_id,
            repository: row.repository,
            error_pattern: row.error_pattern,
            error_message: row.error_message,
            status: FixStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            pull_request_number: row.pull_request_number.map(|n| n as u64),
            pull_request_url: row.pull_request_url,
            failure_reason: row.failure_reason,
            attempted_at: parse_ts(&row.attempted_at)?,
            completed_at: parse_opt_ts(row.completed_at.as_deref())?,
            completion_claimed_at: parse_opt_ts(row.completion_claimed_at.as_deref())?,
        })
    }
}
