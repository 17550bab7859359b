//! The integrity validator

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

use super::cache::ValidationCache;
use super::security::scan_settings;
use super::{IssueCode, ValidationResult, ValidationStage};
use crate::config::ValidationConfig;
use crate::job::settings::is_language_code;
use crate::job::{
    compute_integrity_hash, verify_integrity, IntegrityCheck, JobRecord, JobSettings, JobStatus,
};
use crate::storage::JobSession;

static JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").expect("valid regex"));

/// Share of the processing ceiling after which a running job gets a warning
const PROCESSING_WARNING_RATIO: f64 = 0.8;

pub struct IntegrityValidator {
    config: ValidationConfig,
    cache: ValidationCache,
}

impl IntegrityValidator {
    pub fn new(config: ValidationConfig, cache: ValidationCache) -> Self {
        Self { config, cache }
    }

    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    /// Accepted values for the `max_length` setting
    pub fn max_length_range(&self) -> RangeInclusive<u32> {
        self.config.min_max_length..=self.config.max_max_length
    }

    /// Structural, referential and security checks before a job is queued
    ///
    /// On success the integrity hash is written to `job.integrity_hash`.
    pub async fn validate_for_enqueue(
        &self,
        session: &JobSession,
        job: &mut JobRecord,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(&job.id, ValidationStage::Enqueue);

        self.check_fields(job, &mut result);
        if job.status != JobStatus::Queued {
            result.error(
                IssueCode::InvalidStatus,
                Some("status"),
                format!("new jobs must be queued, found {}", job.status),
            );
        }
        if result.is_valid {
            self.check_references(session, job, &mut result).await;
        }
        self.check_settings(job, &mut result);

        if result.is_valid {
            let hash = compute_integrity_hash(job);
            result.info(
                IssueCode::IntegrityHashComputed,
                None,
                format!("integrity hash {}", &hash[..12]),
            );
            job.integrity_hash = Some(hash.clone());
            result.integrity_hash = Some(hash);
        }

        self.finish(result).await
    }

    /// Status, timestamp, tamper and runtime checks while a job is in flight
    pub async fn validate_during_processing(&self, job: &JobRecord) -> ValidationResult {
        let baseline = self.cache.enqueue_hash(&job.id).await;
        let mut result = ValidationResult::new(&job.id, ValidationStage::Processing);
        self.check_processing(job, baseline.as_deref(), &mut result);
        self.finish(result).await
    }

    /// Terminal-state, timestamp ordering, duration and tamper checks
    pub async fn validate_completion(
        &self,
        job: &JobRecord,
        output: Option<&Value>,
    ) -> ValidationResult {
        let baseline = self.cache.enqueue_hash(&job.id).await;
        let mut result = ValidationResult::new(&job.id, ValidationStage::Completion);
        self.check_completion(job, output, baseline.as_deref(), &mut result);
        self.finish(result).await
    }

    /// The checks for a stored record's current lifecycle stage, against the
    /// cached enqueue baseline
    pub async fn check_stored(&self, job: &JobRecord) -> ValidationResult {
        if job.status.is_terminal() {
            self.validate_completion(job, None).await
        } else {
            self.validate_during_processing(job).await
        }
    }

    /// Validation the recovery engine runs on a repaired record before it is
    /// written back. Stage is processing for live jobs and completion for
    /// terminal ones. The record's re-derived hash stands in for the enqueue
    /// baseline, which is only rebased once the repair is persisted.
    pub async fn revalidate(&self, job: &JobRecord) -> ValidationResult {
        let baseline = job.integrity_hash.as_deref();
        let mut result = if job.status.is_terminal() {
            let mut result = ValidationResult::new(&job.id, ValidationStage::Completion);
            self.check_completion(job, None, baseline, &mut result);
            result
        } else {
            let mut result = ValidationResult::new(&job.id, ValidationStage::Processing);
            self.check_processing(job, baseline, &mut result);
            result
        };
        self.check_settings(job, &mut result);
        self.finish(result).await
    }

    fn check_processing(
        &self,
        job: &JobRecord,
        baseline: Option<&str>,
        result: &mut ValidationResult,
    ) {
        if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            result.error(
                IssueCode::InvalidStatus,
                Some("status"),
                format!("job is {} and cannot be processed", job.status),
            );
        }
        if job.status == JobStatus::Running && job.started_at.is_none() {
            result.error(
                IssueCode::MissingTimestamp,
                Some("started_at"),
                "running job has no start time",
            );
        }

        self.check_integrity(job, baseline, result);

        if let (JobStatus::Running, Some(started)) = (job.status, job.started_at) {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            let ceiling = self.config.max_processing_time;
            if elapsed > ceiling {
                result.error(
                    IssueCode::ProcessingTimeout,
                    Some("started_at"),
                    format!(
                        "processing for {}s exceeds the {}s ceiling",
                        elapsed.as_secs(),
                        ceiling.as_secs()
                    ),
                );
            } else if elapsed.as_secs_f64() > ceiling.as_secs_f64() * PROCESSING_WARNING_RATIO {
                result.warning(
                    IssueCode::ProcessingTimeWarning,
                    Some("started_at"),
                    format!("processing for {}s, close to the ceiling", elapsed.as_secs()),
                );
            }
        }
    }

    fn check_completion(
        &self,
        job: &JobRecord,
        output: Option<&Value>,
        baseline: Option<&str>,
        result: &mut ValidationResult,
    ) {
        if !job.status.is_terminal() {
            result.error(
                IssueCode::InvalidStatus,
                Some("status"),
                format!("job is {} but completion requires a terminal status", job.status),
            );
        }
        if job.completed_at.is_none() {
            result.error(
                IssueCode::MissingTimestamp,
                Some("completed_at"),
                "terminal job has no completion time",
            );
        }
        if job.status == JobStatus::Completed && job.started_at.is_none() {
            result.error(
                IssueCode::MissingTimestamp,
                Some("started_at"),
                "completed job has no start time",
            );
        }

        if let Some(started) = job.started_at {
            if started < job.created_at {
                result.error(
                    IssueCode::TimestampOrder,
                    Some("started_at"),
                    "job started before it was created",
                );
            }
        }
        if let Some(completed) = job.completed_at {
            let floor = job.started_at.unwrap_or(job.created_at);
            if completed < floor {
                result.error(
                    IssueCode::TimestampOrder,
                    Some("completed_at"),
                    "job completed before it started",
                );
            }
        }

        if let Some(duration) = job.processing_duration().and_then(|d| d.to_std().ok()) {
            if duration < self.config.min_expected_duration {
                result.warning(
                    IssueCode::DurationTooShort,
                    None,
                    format!("processing took only {}ms", duration.as_millis()),
                );
            } else if duration > self.config.max_expected_duration {
                result.warning(
                    IssueCode::DurationTooLong,
                    None,
                    format!("processing took {}s", duration.as_secs()),
                );
            }
        }

        if job.status == JobStatus::Completed && output.is_none_or(Value::is_null) {
            result.warning(
                IssueCode::EmptyResult,
                None,
                "completed job produced no output",
            );
        }

        self.check_integrity(job, baseline, result);
    }

    fn check_fields(&self, job: &JobRecord, result: &mut ValidationResult) {
        if job.id.is_empty() {
            result.error(IssueCode::MissingField, Some("id"), "job id is required");
        } else if !JOB_ID.is_match(&job.id) {
            result.error(
                IssueCode::InvalidFormat,
                Some("id"),
                "job id must be 1-64 characters of letters, digits, '-' or '_'",
            );
        }
        if job.owner_id <= 0 {
            result.error(
                IssueCode::InvalidValue,
                Some("owner_id"),
                format!("owner id must be positive, got {}", job.owner_id),
            );
        }
        if job.connection_id <= 0 {
            result.error(
                IssueCode::InvalidValue,
                Some("connection_id"),
                format!("connection id must be positive, got {}", job.connection_id),
            );
        }
    }

    async fn check_references(
        &self,
        session: &JobSession,
        job: &JobRecord,
        result: &mut ValidationResult,
    ) {
        match session.exists(&job.id).await {
            Ok(true) => result.error(
                IssueCode::DuplicateJob,
                Some("id"),
                format!("job {} already exists", job.id),
            ),
            Ok(false) => {}
            Err(e) => result.error(
                IssueCode::StoreUnavailable,
                None,
                format!("uniqueness check failed: {}", e),
            ),
        }

        match session.connection_owner(job.connection_id).await {
            Ok(Some(owner)) if owner == job.owner_id => {}
            Ok(Some(_)) => result.error(
                IssueCode::OwnershipMismatch,
                Some("connection_id"),
                format!(
                    "connection {} does not belong to owner {}",
                    job.connection_id, job.owner_id
                ),
            ),
            Ok(None) => result.error(
                IssueCode::ConnectionNotFound,
                Some("connection_id"),
                format!("connection {} does not exist", job.connection_id),
            ),
            Err(e) => result.error(
                IssueCode::StoreUnavailable,
                None,
                format!("ownership check failed: {}", e),
            ),
        }
    }

    fn check_settings(&self, job: &JobRecord, result: &mut ValidationResult) {
        let size = serde_json::to_vec(&job.settings).map(|b| b.len()).unwrap_or(0);
        if size > self.config.max_settings_bytes {
            result.error(
                IssueCode::SettingsTooLarge,
                Some("settings"),
                format!(
                    "settings are {} bytes, limit is {}",
                    size, self.config.max_settings_bytes
                ),
            );
            return;
        }

        let mut missing = false;
        for key in &self.config.required_settings {
            if !job.settings.contains_key(key) {
                missing = true;
                result.error(
                    IssueCode::MissingSetting,
                    Some(format!("settings.{}", key).as_str()),
                    format!("required setting '{}' is missing", key),
                );
            }
        }
        if missing {
            return;
        }

        let settings = match JobSettings::parse(&job.settings) {
            Ok(s) => s,
            Err(e) => {
                result.error(
                    IssueCode::InvalidSettings,
                    Some("settings"),
                    format!("settings do not match the expected shape: {}", e),
                );
                return;
            }
        };

        let range = self.max_length_range();
        if !range.contains(&settings.max_length) {
            result.error(
                IssueCode::SettingOutOfRange,
                Some("settings.max_length"),
                format!(
                    "max_length {} is outside {}..={}",
                    settings.max_length,
                    range.start(),
                    range.end()
                ),
            );
        }
        if !is_language_code(&settings.language) {
            result.error(
                IssueCode::InvalidFormat,
                Some("settings.language"),
                format!("'{}' is not a two-letter language code", settings.language),
            );
        }

        for finding in scan_settings(&settings) {
            result.error(
                IssueCode::SecurityViolation,
                Some(format!("settings.{}", finding.path).as_str()),
                finding.reason,
            );
        }
    }

    fn check_integrity(
        &self,
        job: &JobRecord,
        baseline: Option<&str>,
        result: &mut ValidationResult,
    ) {
        match verify_integrity(job, baseline) {
            IntegrityCheck::Match => {
                result.integrity_hash = Some(compute_integrity_hash(job));
            }
            IntegrityCheck::Mismatch { expected, actual } => {
                warn!(
                    "Integrity mismatch on job {}: expected {}, derived {}",
                    job.id, expected, actual
                );
                result.error(
                    IssueCode::DataIntegrityViolation,
                    None,
                    "job fields changed since the integrity hash was taken",
                );
                return;
            }
            IntegrityCheck::Missing => {
                result.warning(
                    IssueCode::IntegrityHashMissing,
                    None,
                    "no integrity hash to compare against",
                );
                return;
            }
        }

        // The stored hash itself may have been rewritten alongside the fields
        if let (Some(baseline), Some(stored)) = (baseline, job.integrity_hash.as_deref()) {
            if baseline != stored {
                result.integrity_hash = None;
                result.error(
                    IssueCode::DataIntegrityViolation,
                    Some("integrity_hash"),
                    "stored integrity hash differs from the one recorded at enqueue",
                );
            }
        }
    }

    async fn finish(&self, result: ValidationResult) -> ValidationResult {
        debug!(
            "Validation of {} at {:?}: valid={} issues={}",
            result.job_id,
            result.stage,
            result.is_valid,
            result.issues.len()
        );
        self.cache.record(&result).await;
        result
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
