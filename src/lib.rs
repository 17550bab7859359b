//! # jobguard
//!
//! Resilience layer for an asynchronous job pipeline.
//!
//! ## Modules
//!
//! - `retry` - Failure classification, retry policy and the permanent-failure path
//! - `dlq` - Bounded dead letter store with pattern analysis
//! - `validation` - Integrity validation at enqueue, mid-processing and completion
//! - `recovery` - Backup snapshots and corrupted-record recovery
//! - `orchestrator` - System diagnosis and operator recovery plans
//! - `monitor` - Threshold alerts, notification channels and automated recovery
//! - `worker` - Job queue, processing pipeline and worker pool
//! - `storage` - Queue backend and job store abstractions with memory, Redis and PostgreSQL implementations
//! - `app` - Logging, fatal error reporting and service wiring for the CLI
pub mod app;
pub mod config;
pub mod context;
pub mod dlq;
pub mod error;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod storage;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod property_tests;

pub use config::JobGuardConfig;
pub use error::{ErrorCode, JobGuardError, Result};
pub use job::{JobRecord, JobStatus, Priority};
