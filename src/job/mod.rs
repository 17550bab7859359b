//! Job record model
//!
//! The job record is owned by the relational store; everything else in this
//! crate reads it, validates it, and (for the failure and recovery paths)
//! rewrites its status, timestamps and error payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod integrity;
pub mod settings;

pub use integrity::{compute_integrity_hash, verify_integrity, IntegrityCheck};
pub use settings::JobSettings;

use crate::retry::FaultCategory;

/// Queue a job lands on when none is specified
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Completed, Failed and Cancelled are terminal
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Ok(JobStatus::Queued),
            "running" | "processing" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Scheduling priority; higher priorities are popped first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Highest first, the order workers drain ready queues in
    pub const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// One entry of a job's structured error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub occurred_at: DateTime<Utc>,
    pub error_type: String,
    pub category: FaultCategory,
    /// Sanitized and length-capped
    pub message: String,
    pub attempt: u32,
    /// True for the record written when the job failed permanently
    #[serde(default)]
    pub terminal: bool,
}

/// Rejected lifecycle transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {job_id} is {status} and can no longer change state")]
    Terminal { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    Invalid {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// The unit of work tracked through Queued -> Running -> terminal states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub owner_id: i64,
    pub connection_id: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub settings: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Vec<ErrorRecord>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub integrity_hash: Option<String>,
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_string()
}

impl JobRecord {
    /// Create a freshly queued job with default settings
    pub fn new(id: impl Into<String>, owner_id: i64, connection_id: i64) -> Self {
        Self {
            id: id.into(),
            owner_id,
            connection_id,
            status: JobStatus::Queued,
            priority: Priority::default(),
            settings: JobSettings::default().to_map(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: Vec::new(),
            retry_count: 0,
            last_retry_at: None,
            queue_name: default_queue_name(),
            integrity_hash: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_settings(mut self, settings: Map<String, Value>) -> Self {
        self.settings = settings;
        self
    }

    /// Queued -> Running
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        if self.status != JobStatus::Queued {
            return Err(self.invalid(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// Running -> Completed
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Completed));
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Queued/Running -> Failed, appending the terminal error record
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        record: ErrorRecord,
    ) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = JobStatus::Failed;
        self.completed_at = Some(now);
        self.error_message.push(record);
        Ok(())
    }

    /// Queued/Running -> Cancelled
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Running -> Queued for another attempt
    pub fn requeue_for_retry(
        &mut self,
        now: DateTime<Utc>,
        record: ErrorRecord,
    ) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.error_message.push(record);
        Ok(())
    }

    /// Failed -> Queued with a fresh retry budget. Operator-initiated only;
    /// the earlier error records are kept.
    pub fn reopen(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Failed {
            return Err(self.invalid(JobStatus::Queued));
        }
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.completed_at = None;
        self.retry_count = 0;
        Ok(())
    }

    /// Wall-clock processing time, when both ends are known
    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn ensure_mutable(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                job_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn invalid(&self, to: JobStatus) -> TransitionError {
        TransitionError::Invalid {
            job_id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}
