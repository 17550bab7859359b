//! Integrity validation of job records
//!
//! One engine, three entry points: enqueue, mid-processing and completion.
//! Errors block the lifecycle transition that triggered the check; warnings
//! and info entries never do. Every entry carries an [`IssueCode`] so callers
//! can branch without matching on message text.

pub mod cache;
pub mod security;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorCode, JobGuardError};

pub use cache::{StageStats, ValidationCache, ValidationStats};
pub use security::{scan_settings, SecurityFinding};
pub use validator::IntegrityValidator;

/// Validation issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Machine-readable issue code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCode {
    MissingField,
    InvalidFormat,
    InvalidValue,
    DuplicateJob,
    ConnectionNotFound,
    OwnershipMismatch,
    SettingsTooLarge,
    InvalidSettings,
    MissingSetting,
    SettingOutOfRange,
    SecurityViolation,
    InvalidStatus,
    MissingTimestamp,
    TimestampOrder,
    DataIntegrityViolation,
    IntegrityHashMissing,
    ProcessingTimeout,
    ProcessingTimeWarning,
    DurationTooShort,
    DurationTooLong,
    EmptyResult,
    StoreUnavailable,
    IntegrityHashComputed,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle point a validation pass ran at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Enqueue,
    Processing,
    Completion,
}

impl ValidationStage {
    pub const ALL: [ValidationStage; 3] = [
        ValidationStage::Enqueue,
        ValidationStage::Processing,
        ValidationStage::Completion,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStage::Enqueue => "enqueue",
            ValidationStage::Processing => "processing",
            ValidationStage::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    pub field: Option<String>,
    pub message: String,
}

/// Outcome of one validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub job_id: String,
    pub stage: ValidationStage,
    pub is_valid: bool,
    /// In the order the checks produced them
    pub issues: Vec<ValidationIssue>,
    pub integrity_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub(crate) fn new(job_id: impl Into<String>, stage: ValidationStage) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            is_valid: true,
            issues: Vec::new(),
            integrity_hash: None,
            timestamp: Utc::now(),
        }
    }

    fn push(&mut self, severity: Severity, code: IssueCode, field: Option<&str>, message: String) {
        if severity == Severity::Error {
            self.is_valid = false;
        }
        self.issues.push(ValidationIssue {
            severity,
            code,
            field: field.map(str::to_string),
            message,
        });
    }

    pub(crate) fn error(&mut self, code: IssueCode, field: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Error, code, field, message.into());
    }

    pub(crate) fn warning(
        &mut self,
        code: IssueCode,
        field: Option<&str>,
        message: impl Into<String>,
    ) {
        self.push(Severity::Warning, code, field, message.into());
    }

    pub(crate) fn info(&mut self, code: IssueCode, field: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Info, code, field, message.into());
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_code(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    /// Error messages joined for a fault or log line
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|i| format!("{}: {}", i.code, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `Err` when any error-severity issue was found
    pub fn ensure_valid(self) -> crate::error::Result<Self> {
        if self.is_valid {
            return Ok(self);
        }
        let code = if self.has_code(IssueCode::DataIntegrityViolation) {
            ErrorCode::VALIDATION_INTEGRITY_VIOLATION
        } else {
            ErrorCode::VALIDATION_REJECTED
        };
        Err(JobGuardError::validation(
            code,
            format!("{:?} checks failed: {}", self.stage, self.error_summary()),
            Some(self.job_id),
        ))
    }
}
