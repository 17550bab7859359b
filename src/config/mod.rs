//! Runtime configuration
//!
//! Every section deserializes with defaults, so an empty TOML file (or no file)
//! yields a working in-process setup. `loader` resolves the file location and
//! layers environment overrides on top.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ErrorCode, JobGuardError, Result};
use crate::storage::StorageConfig;

pub use loader::{default_config_path, load_config, ConfigLoader};

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobGuardConfig {
    /// Log level used when neither `-v` nor `RUST_LOG` says otherwise
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: bool,
    /// Fraction of the delay jitter may add or remove
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Attempts allowed for resource-exhaustion faults, tighter than `max_retries`
    #[serde(default = "default_resource_exhaustion_max_attempts")]
    pub resource_exhaustion_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            exponential_base: default_exponential_base(),
            max_delay: default_max_delay(),
            jitter: false,
            jitter_factor: default_jitter_factor(),
            resource_exhaustion_max_attempts: default_resource_exhaustion_max_attempts(),
        }
    }
}

/// Dead letter store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_max_size")]
    pub max_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_analysis_sample_size")]
    pub analysis_sample_size: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: default_dlq_max_size(),
            retention_days: default_retention_days(),
            max_message_length: default_max_message_length(),
            analysis_sample_size: default_analysis_sample_size(),
        }
    }
}

impl DlqConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }
}

/// Integrity validator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Serialized settings size cap, in bytes
    #[serde(default = "default_max_settings_bytes")]
    pub max_settings_bytes: usize,
    #[serde(default = "default_required_settings")]
    pub required_settings: Vec<String>,
    #[serde(default = "default_min_max_length")]
    pub min_max_length: u32,
    #[serde(default = "default_max_max_length")]
    pub max_max_length: u32,
    #[serde(with = "humantime_serde", default = "default_max_processing_time")]
    pub max_processing_time: Duration,
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_min_expected_duration")]
    pub min_expected_duration: Duration,
    #[serde(with = "humantime_serde", default = "default_max_expected_duration")]
    pub max_expected_duration: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_settings_bytes: default_max_settings_bytes(),
            required_settings: default_required_settings(),
            min_max_length: default_min_max_length(),
            max_max_length: default_max_max_length(),
            max_processing_time: default_max_processing_time(),
            cache_ttl: default_cache_ttl(),
            min_expected_duration: default_min_expected_duration(),
            max_expected_duration: default_max_expected_duration(),
        }
    }
}

/// Backup and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(with = "humantime_serde", default = "default_backup_ttl")]
    pub backup_ttl: Duration,
    #[serde(default = "default_audit_log_max")]
    pub audit_log_max: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backup_ttl: default_backup_ttl(),
            audit_log_max: default_audit_log_max(),
        }
    }
}

/// Diagnosis thresholds and recovery action parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde", default = "default_stuck_threshold")]
    pub stuck_threshold: Duration,
    #[serde(with = "humantime_serde", default = "default_backend_latency_warning")]
    pub backend_latency_warning: Duration,
    #[serde(with = "humantime_serde", default = "default_store_latency_warning")]
    pub store_latency_warning: Duration,
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,
    #[serde(default = "default_backlog_critical")]
    pub backlog_critical: usize,
    #[serde(with = "humantime_serde", default = "default_retry_failed_window")]
    pub retry_failed_window: Duration,
    #[serde(default = "default_retry_failed_limit")]
    pub retry_failed_limit: usize,
    /// Upper bound on each diagnosis probe
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: default_stuck_threshold(),
            backend_latency_warning: default_backend_latency_warning(),
            store_latency_warning: default_store_latency_warning(),
            backlog_warning: default_backlog_warning(),
            backlog_critical: default_backlog_critical(),
            retry_failed_window: default_retry_failed_window(),
            retry_failed_limit: default_retry_failed_limit(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Warning/critical pair for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Per-metric alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThresholds {
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth: Threshold,
    /// Percent of finished jobs in the last hour that failed
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate: Threshold,
    /// Seconds
    #[serde(default = "default_avg_processing_threshold")]
    pub avg_processing_time: Threshold,
    /// Seconds
    #[serde(default = "default_p95_processing_threshold")]
    pub p95_processing_time: Threshold,
    /// Percent of the backend memory ceiling
    #[serde(default = "default_backend_memory_threshold")]
    pub backend_memory: Threshold,
    /// Milliseconds
    #[serde(default = "default_backend_response_threshold")]
    pub backend_response_time: Threshold,
    #[serde(default = "default_stuck_tasks_threshold")]
    pub stuck_tasks: Threshold,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth_threshold(),
            failure_rate: default_failure_rate_threshold(),
            avg_processing_time: default_avg_processing_threshold(),
            p95_processing_time: default_p95_processing_threshold(),
            backend_memory: default_backend_memory_threshold(),
            backend_response_time: default_backend_response_threshold(),
            stuck_tasks: default_stuck_tasks_threshold(),
        }
    }
}

impl MetricThresholds {
    pub fn all(&self) -> [(&'static str, Threshold); 7] {
        [
            ("queue_depth", self.queue_depth),
            ("failure_rate", self.failure_rate),
            ("avg_processing_time", self.avg_processing_time),
            ("p95_processing_time", self.p95_processing_time),
            ("backend_memory", self.backend_memory),
            ("backend_response_time", self.backend_response_time),
            ("stuck_tasks", self.stuck_tasks),
        ]
    }
}

/// Monitor & alerter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub interval: Duration,
    /// Alerts per (metric, severity) allowed inside `throttle_window`
    #[serde(default = "default_throttle_max")]
    pub throttle_max: usize,
    #[serde(with = "humantime_serde", default = "default_throttle_window")]
    pub throttle_window: Duration,
    /// Mirror active alerts into the queue backend
    #[serde(default)]
    pub persist_alerts: bool,
    /// Execute mapped recovery actions on critical alerts without approval
    #[serde(default)]
    pub auto_recovery: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub thresholds: MetricThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            throttle_max: default_throttle_max(),
            throttle_window: default_throttle_window(),
            persist_alerts: false,
            auto_recovery: false,
            webhook_url: None,
            thresholds: MetricThresholds::default(),
        }
    }
}

/// Job store session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers started by `run`
    #[serde(default = "default_worker_count")]
    pub count: u32,
    /// Upper bound for scale commands
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Queue names consumed, in no particular order
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// A worker whose heartbeat is older than this counts as gone
    #[serde(with = "humantime_serde", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            max_workers: default_max_workers(),
            queues: default_worker_queues(),
            poll_interval: default_poll_interval(),
            heartbeat_ttl: default_heartbeat_ttl(),
        }
    }
}

// Default value functions for serde
fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(3600)
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_resource_exhaustion_max_attempts() -> u32 {
    2
}

fn default_dlq_max_size() -> usize {
    1000
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_message_length() -> usize {
    500
}

fn default_analysis_sample_size() -> usize {
    100
}

fn default_max_settings_bytes() -> usize {
    10 * 1024
}

fn default_required_settings() -> Vec<String> {
    vec!["language".to_string(), "max_length".to_string()]
}

fn default_min_max_length() -> u32 {
    10
}

fn default_max_max_length() -> u32 {
    2000
}

fn default_max_processing_time() -> Duration {
    Duration::from_secs(3600)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_min_expected_duration() -> Duration {
    Duration::from_secs(1)
}

fn default_max_expected_duration() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_backup_ttl() -> Duration {
    Duration::from_secs(7 * 86_400)
}

fn default_audit_log_max() -> usize {
    1000
}

fn default_stuck_threshold() -> Duration {
    Duration::from_secs(3600)
}

fn default_backend_latency_warning() -> Duration {
    Duration::from_millis(100)
}

fn default_store_latency_warning() -> Duration {
    Duration::from_millis(500)
}

fn default_backlog_warning() -> usize {
    100
}

fn default_backlog_critical() -> usize {
    1000
}

fn default_retry_failed_window() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_retry_failed_limit() -> usize {
    100
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_depth_threshold() -> Threshold {
    Threshold::new(100.0, 1000.0)
}

fn default_failure_rate_threshold() -> Threshold {
    Threshold::new(10.0, 25.0)
}

fn default_avg_processing_threshold() -> Threshold {
    Threshold::new(300.0, 900.0)
}

fn default_p95_processing_threshold() -> Threshold {
    Threshold::new(600.0, 1800.0)
}

fn default_backend_memory_threshold() -> Threshold {
    Threshold::new(80.0, 95.0)
}

fn default_backend_response_threshold() -> Threshold {
    Threshold::new(100.0, 500.0)
}

fn default_stuck_tasks_threshold() -> Threshold {
    Threshold::new(1.0, 10.0)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_throttle_max() -> usize {
    3
}

fn default_throttle_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_worker_count() -> u32 {
    2
}

fn default_max_workers() -> u32 {
    16
}

fn default_worker_queues() -> Vec<String> {
    vec![crate::job::DEFAULT_QUEUE.to_string()]
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

impl JobGuardConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn effective_log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Check cross-field constraints, reporting every violation at once
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(level) = &self.log_level {
            if !VALID_LOG_LEVELS.contains(&level.as_str()) {
                errors.push(format!(
                    "log_level must be one of: {}",
                    VALID_LOG_LEVELS.join(", ")
                ));
            }
        }

        if self.retry.base_delay > self.retry.max_delay {
            errors.push("retry.base_delay must not exceed retry.max_delay".to_string());
        }
        if self.retry.exponential_base < 1.0 {
            errors.push("retry.exponential_base must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            errors.push("retry.jitter_factor must be between 0 and 1".to_string());
        }

        if self.dlq.max_size == 0 {
            errors.push("dlq.max_size must be greater than zero".to_string());
        }
        if self.dlq.retention_days == 0 {
            errors.push("dlq.retention_days must be greater than zero".to_string());
        }
        if self.dlq.max_message_length == 0 {
            errors.push("dlq.max_message_length must be greater than zero".to_string());
        }

        if self.validation.max_settings_bytes == 0 {
            errors.push("validation.max_settings_bytes must be greater than zero".to_string());
        }
        if self.validation.min_max_length > self.validation.max_max_length {
            errors.push(
                "validation.min_max_length must not exceed validation.max_max_length".to_string(),
            );
        }
        if self.validation.min_expected_duration > self.validation.max_expected_duration {
            errors.push(
                "validation.min_expected_duration must not exceed validation.max_expected_duration"
                    .to_string(),
            );
        }

        if self.orchestrator.backlog_warning >= self.orchestrator.backlog_critical {
            errors.push(
                "orchestrator.backlog_warning must be below orchestrator.backlog_critical"
                    .to_string(),
            );
        }

        if self.workers.count > self.workers.max_workers {
            errors.push("workers.count must not exceed workers.max_workers".to_string());
        }
        if self.workers.queues.is_empty() {
            errors.push("workers.queues must name at least one queue".to_string());
        }
        if self.workers.poll_interval.is_zero() {
            errors.push("workers.poll_interval must be greater than zero".to_string());
        }

        if self.monitor.interval.is_zero() {
            errors.push("monitor.interval must be greater than zero".to_string());
        }
        if self.monitor.throttle_max == 0 {
            errors.push("monitor.throttle_max must be greater than zero".to_string());
        }
        for (name, threshold) in self.monitor.thresholds.all() {
            if threshold.warning >= threshold.critical {
                errors.push(format!(
                    "monitor.thresholds.{}: warning ({}) must be below critical ({})",
                    name, threshold.warning, threshold.critical
                ));
            }
        }

        if let Err(e) = self.storage.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(JobGuardError::config_with_code(
                ErrorCode::CONFIG_VALIDATION_FAILED,
                errors.join("; "),
            ))
        }
    }
}
