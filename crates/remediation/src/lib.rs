//! Automated CI remediation.
//!
//! Watches CI for failed builds, classifies the failure, asks the task
//! service for a fix and opens a pull request once the fix task completes.
//!
//! # Architecture
//!
//! - [`ci`]: classifier, orchestrator, message consumer and HTTP intake
//! - [`sensors`]: build poller feeding the orchestrator
//! - [`store`]: persistence of builds, failures and fix attempts
//! - [`service`]: wiring of the long-running process
//! - [`config`]: JSON configuration with defaults for every field

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ci;
pub mod config;
pub mod retry;
pub mod sensors;
pub mod service;
pub mod store;

pub use config::RemediationConfig;
pub use service::Service;
