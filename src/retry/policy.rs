//! Retry decisions and backoff delays

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classify::{Fault, FaultCategory};
use crate::config::RetryConfig;

/// Backoff strategy assigned to a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Linear,
    Exponential,
    NoRetry,
}

/// Static category -> strategy table
pub fn strategy_for(category: FaultCategory) -> BackoffStrategy {
    match category {
        FaultCategory::TransientNetwork
        | FaultCategory::QueueBackendConnection
        | FaultCategory::DatabaseConnection
        | FaultCategory::ProcessingError
        | FaultCategory::SystemError => BackoffStrategy::Exponential,
        FaultCategory::ResourceExhaustion => BackoffStrategy::Linear,
        FaultCategory::TaskValidation | FaultCategory::SecurityError => BackoffStrategy::NoRetry,
    }
}

/// Why a retry was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxRetriesExceeded,
    NonRetryableCategory,
    /// Permission or pure-validation fault under an otherwise retryable category
    NonRetryableFault,
    /// Resource-exhaustion fault past its tighter attempt cap
    ResourceExhaustionCap,
}

/// Outcome of `RetryPolicy::decide`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub strategy: BackoffStrategy,
    pub stop_reason: Option<StopReason>,
}

impl RetryDecision {
    fn stop(strategy: BackoffStrategy, reason: StopReason) -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            strategy,
            stop_reason: Some(reason),
        }
    }

    /// Delay rounded to whole seconds
    pub fn delay_seconds(&self) -> u64 {
        self.delay.as_secs_f64().round() as u64
    }
}

/// Category-driven retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide whether attempt `attempt` (zero-based) of a job that failed with
    /// `fault` gets another try, and after how long
    pub fn decide(&self, category: FaultCategory, attempt: u32, fault: &Fault) -> RetryDecision {
        let strategy = strategy_for(category);

        if attempt >= self.config.max_retries {
            return RetryDecision::stop(strategy, StopReason::MaxRetriesExceeded);
        }
        if strategy == BackoffStrategy::NoRetry {
            return RetryDecision::stop(strategy, StopReason::NonRetryableCategory);
        }
        if fault.kind.is_permission_or_validation() {
            return RetryDecision::stop(strategy, StopReason::NonRetryableFault);
        }
        // Override rule layered over the table: tighter cap for exhaustion faults
        if fault.kind.is_resource_exhaustion()
            && attempt >= self.config.resource_exhaustion_max_attempts
        {
            return RetryDecision::stop(strategy, StopReason::ResourceExhaustionCap);
        }

        RetryDecision {
            retry: true,
            delay: self.apply_jitter(self.calculate_delay(strategy, attempt)),
            strategy,
            stop_reason: None,
        }
    }

    /// Un-jittered delay for `attempt` under `strategy`, capped at `max_delay`
    pub fn calculate_delay(&self, strategy: BackoffStrategy, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let secs = match strategy {
            BackoffStrategy::Immediate | BackoffStrategy::NoRetry => 0.0,
            BackoffStrategy::Linear => base * f64::from(attempt + 1),
            BackoffStrategy::Exponential => {
                base * self.config.exponential_base.powi(attempt.min(i32::MAX as u32) as i32)
            }
        };
        // f64::min discards NaN, and an overflowed power is +inf, so this is finite
        let capped = secs.min(self.config.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Spread a delay by up to +/- half the jitter factor, never past `max_delay`
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.config.jitter_factor;
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        let secs = (delay.as_secs_f64() + jitter)
            .max(0.0)
            .min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
