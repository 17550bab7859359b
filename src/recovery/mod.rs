//! Backup snapshots, corrupted-record recovery and its audit trail

pub mod backup;
pub mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub use backup::{BackupSnapshot, BackupStore};
pub use engine::RecoveryEngine;

use crate::error::{ErrorCode, JobGuardError};
use crate::job::JobRecord;
use crate::storage::{page_bounds, QueueBackend, StorageResult};
use crate::validation::ValidationResult;

pub const AUDIT_LOG_KEY: &str = "recovery:log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecoveryMethod {
    RestoreFromBackup,
    ReconstructFromLogs,
    PartialRecovery,
    ResetToDefaults,
}

impl RecoveryMethod {
    /// Priority order strategies are tried in
    pub const ORDER: [RecoveryMethod; 4] = [
        RecoveryMethod::RestoreFromBackup,
        RecoveryMethod::ReconstructFromLogs,
        RecoveryMethod::PartialRecovery,
        RecoveryMethod::ResetToDefaults,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Success,
    PartialSuccess,
    /// The job could not be saved; reset-to-defaults lands here too
    Failed,
    NotRecoverable,
}

/// What was found wrong with a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub description: String,
    pub fields: Vec<String>,
}

impl CorruptionReport {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn from_validation(result: &ValidationResult) -> Self {
        Self {
            description: result.error_summary(),
            fields: result.errors().filter_map(|i| i.field.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub job_id: String,
    pub status: RecoveryStatus,
    pub method_used: Option<RecoveryMethod>,
    pub recovered_data: Option<JobRecord>,
    pub notes: Vec<String>,
    pub validation_passed: bool,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    pub(crate) fn new(
        job_id: impl Into<String>,
        status: RecoveryStatus,
        method_used: Option<RecoveryMethod>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            method_used,
            recovered_data: None,
            notes: Vec::new(),
            validation_passed: false,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub(crate) fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes.extend(notes);
        self
    }

    /// `Err` unless a usable record was written back. A reset to defaults
    /// counts as written even though it fails the job.
    pub fn ensure_recovered(self) -> crate::error::Result<Self> {
        let code = match self.status {
            RecoveryStatus::NotRecoverable => ErrorCode::RECOVERY_NOT_RECOVERABLE,
            RecoveryStatus::Failed if self.recovered_data.is_none() => {
                ErrorCode::RECOVERY_ACTION_FAILED
            }
            _ => return Ok(self),
        };
        let message = match self.notes.last() {
            Some(note) => format!("recovery ended {:?}: {}", self.status, note),
            None => format!("recovery ended {:?}", self.status),
        };
        Err(JobGuardError::recovery(code, message, Some(self.job_id)))
    }
}

/// One audit line per recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    pub correlation_id: String,
    pub job_id: String,
    pub method: Option<RecoveryMethod>,
    pub status: RecoveryStatus,
    pub notes: Vec<String>,
    pub validation_passed: bool,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryLogEntry {
    pub fn from_result(result: &RecoveryResult, correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            job_id: result.job_id.clone(),
            method: result.method_used,
            status: result.status,
            notes: result.notes.clone(),
            validation_passed: result.validation_passed,
            timestamp: result.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_attempts: usize,
    pub by_method: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// Percentage of attempts whose result passed re-validation
    pub validation_pass_rate: Option<f64>,
}

/// Bounded, newest-first audit log on the queue backend
#[derive(Clone)]
pub struct AuditLog {
    backend: Arc<dyn QueueBackend>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn QueueBackend>, max_entries: usize) -> Self {
        Self {
            backend,
            max_entries,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub async fn append(&self, entry: &RecoveryLogEntry) {
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode recovery log entry: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .backend
            .push_trimmed(AUDIT_LOG_KEY, &raw, self.max_entries)
            .await
        {
            warn!("Failed to write recovery log entry for {}: {}", entry.job_id, e);
        }
    }

    pub async fn recent(&self, limit: usize) -> StorageResult<Vec<RecoveryLogEntry>> {
        let Some((start, stop)) = page_bounds(0, limit) else {
            return Ok(Vec::new());
        };
        let raw = self.backend.range(AUDIT_LOG_KEY, start, stop).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    pub async fn stats(&self) -> StorageResult<RecoveryStats> {
        let entries = self.recent(self.max_entries).await?;
        let mut stats = RecoveryStats {
            total_attempts: entries.len(),
            ..RecoveryStats::default()
        };
        for entry in &entries {
            let method = entry
                .method
                .map(|m| format!("{:?}", m))
                .unwrap_or_else(|| "None".to_string());
            *stats.by_method.entry(method).or_insert(0) += 1;
            *stats
                .by_status
                .entry(format!("{:?}", entry.status))
                .or_insert(0) += 1;
        }
        if !entries.is_empty() {
            let passed = entries.iter().filter(|e| e.validation_passed).count();
            stats.validation_pass_rate = Some(passed as f64 / entries.len() as f64 * 100.0);
        }
        Ok(stats)
    }

    /// Trim to `keep` newest entries
    pub async fn truncate(&self, keep: usize) -> StorageResult<usize> {
        let entries = self.backend.range(AUDIT_LOG_KEY, 0, -1).await?;
        let mut removed = 0;
        for raw in entries.iter().skip(keep) {
            removed += self.backend.remove_value(AUDIT_LOG_KEY, raw).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests;
