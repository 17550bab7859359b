//! Error classification, retry policy and the failure path

pub mod classify;
pub mod handler;
pub mod policy;

pub use classify::{classify, Fault, FaultCategory, FaultKind};
pub use handler::{FailureHandler, FailureOutcome};
pub use policy::{strategy_for, BackoffStrategy, RetryDecision, RetryPolicy, StopReason};
