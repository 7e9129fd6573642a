//! CI remediation: turning failed builds into fix pull requests.
//!
//! This module provides the remediation pipeline:
//! - Classifies build errors against an ordered pattern table
//! - Creates fix tasks on the task-execution service
//! - Opens a pull request when a fix task completes
//! - Publishes lifecycle events to the event bus
//! - Accepts build-failure and task-completion messages over HTTP

pub mod classifier;
pub mod completion;
pub mod consumer;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod sanitize;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export primary types
pub use classifier::{ErrorClassifier, ErrorPattern, PatternConfig};
pub use completion::CompletionOutcome;
pub use consumer::{Delivery, Disposition, MessageBus, MessageConsumer, PipelineMessage};
pub use error::PipelineError;
pub use executor::{HttpTaskExecutor, TaskExecutor, TaskInfo, TaskRequest};
pub use orchestrator::{FixOrchestrator, OrchestratorSettings};
pub use server::{build_router, run_server, ServerState};
pub use types::{Build, BuildFailure, BuildStatus, FixAttempt, FixStatus, RepositoryName};
