//! Pipeline error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use super::executor::ExecutorError;
use super::types::FixStatus;
use crate::store::StoreError;

/// Errors surfaced by the orchestrator and completion handler.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Stored repository is not `owner/repo` (data-integrity bug, never retried)
    #[error("Invalid repository identifier: {0:?}")]
    InvalidRepository(String),

    /// The task-execution collaborator could not create the fix task
    #[error("Task creation failed: {0}")]
    TaskCreation(#[from] ExecutorError),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Attempted to move a fix attempt out of a terminal state
    #[error("Fix attempt {attempt_id} cannot move from {from} to {to}")]
    InvalidTransition {
        attempt_id: Uuid,
        from: FixStatus,
        to: FixStatus,
    },

    /// The message queue is no longer accepting messages
    #[error("Message queue closed")]
    QueueClosed,
}

impl PipelineError {
    /// Stable category name, safe to persist or show to operators.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRepository(_) => "InvalidRepository",
            Self::TaskCreation(e) => e.kind(),
            Self::Store(_) => "StoreError",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::QueueClosed => "QueueClosed",
        }
    }

    /// Whether redelivering the same message may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TaskCreation(_) | Self::Store(_))
    }
}
