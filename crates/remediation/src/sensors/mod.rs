//! Sensors for actively monitoring external systems.
//!
//! The build poller watches CI for completed workflow runs and hands failed
//! ones to the orchestrator.

pub mod github_actions;

pub use github_actions::{extract_error_lines, BuildPoller, PollSummary, PollerConfig};
