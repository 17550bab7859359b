//! Dead letter store for permanently failed jobs
//!
//! Entries live in one bounded list on the queue backend, newest first. Each
//! admission pushes and trims in the same atomic batch that bumps the
//! per-category and per-type counters, so concurrent workers cannot overflow
//! the bound. A retention sweep removes entries older than the retention
//! window regardless of size.

pub mod analysis;
pub mod sanitize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::DlqConfig;
use crate::context::AttemptContext;
use crate::job::{JobRecord, JobStatus, Priority};
use crate::retry::{Fault, FaultCategory};
use crate::storage::{page_bounds, BatchOp, QueueBackend, StorageResult};

pub use analysis::{PatternAnalysis, PatternCount, RetryStats, SignatureGroup, TimeRange};
pub use sanitize::{error_signature, sanitize_message};

pub const ENTRIES_KEY: &str = "dlq:entries";
pub const TOTAL_KEY: &str = "dlq:stats:total";
pub const CATEGORY_PREFIX: &str = "dlq:stats:category:";
pub const TYPE_PREFIX: &str = "dlq:stats:type:";

/// Job fields captured at quarantine time; settings values are not copied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub owner_id: i64,
    pub connection_id: i64,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settings_keys: Vec<String>,
}

impl From<&JobRecord> for JobMetadata {
    fn from(job: &JobRecord) -> Self {
        Self {
            owner_id: job.owner_id,
            connection_id: job.connection_id,
            priority: job.priority,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            settings_keys: job.settings.keys().cloned().collect(),
        }
    }
}

/// Immutable snapshot of a permanently failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub failed_at: DateTime<Utc>,
    pub error_type: String,
    pub error_category: FaultCategory,
    /// Sanitized and length-capped
    pub error_message: String,
    pub retry_count: u32,
    pub job_metadata: JobMetadata,
    pub queue_name: String,
    pub worker_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error_signature: String,
}

/// Fill level of the store relative to `max_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqHealth {
    Healthy,
    Warning,
    Critical,
}

impl DlqHealth {
    fn from_fill(current: usize, max: usize) -> Self {
        let ratio = if max == 0 {
            1.0
        } else {
            current as f64 / max as f64
        };
        if ratio < 0.5 {
            DlqHealth::Healthy
        } else if ratio < 0.9 {
            DlqHealth::Warning
        } else {
            DlqHealth::Critical
        }
    }
}

/// Counters and fill level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub current_size: usize,
    pub max_size: usize,
    pub total_ever_admitted: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub health: DlqHealth,
}

/// Dead letter store over the queue backend
pub struct DeadLetterStore {
    backend: Arc<dyn QueueBackend>,
    config: DlqConfig,
}

impl DeadLetterStore {
    pub fn new(backend: Arc<dyn QueueBackend>, config: DlqConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Build the entry a failed job would be quarantined as
    pub fn build_entry(
        &self,
        job: &JobRecord,
        fault: &Fault,
        category: FaultCategory,
        retry_count: u32,
        ctx: &AttemptContext,
    ) -> DeadLetterEntry {
        let now = Utc::now();
        let message = sanitize_message(&fault.message, self.config.max_message_length);
        DeadLetterEntry {
            job_id: job.id.clone(),
            failed_at: job.completed_at.unwrap_or(now),
            error_type: fault.type_name.clone(),
            error_category: category,
            error_signature: error_signature(&fault.type_name, &message),
            error_message: message,
            retry_count,
            job_metadata: JobMetadata::from(job),
            queue_name: job.queue_name.clone(),
            worker_name: ctx.worker_name.clone(),
            created_at: now,
        }
    }

    /// Quarantine a job. Never fails: storage errors are logged and reported
    /// as `false` so the caller's failure path is not blocked.
    pub async fn admit(
        &self,
        job: &JobRecord,
        fault: &Fault,
        category: FaultCategory,
        retry_count: u32,
        ctx: &AttemptContext,
    ) -> bool {
        let entry = self.build_entry(job, fault, category, retry_count, ctx);
        match self.admit_entry(&entry).await {
            Ok(size) => {
                info!(
                    "Job {} moved to dead letter store ({}, {} retries, store size {})",
                    entry.job_id, entry.error_category, entry.retry_count, size
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to admit job {} to dead letter store: {}",
                    entry.job_id, e
                );
                false
            }
        }
    }

    async fn admit_entry(&self, entry: &DeadLetterEntry) -> StorageResult<usize> {
        let raw = serde_json::to_string(entry)?;
        let retention = self.config.retention();
        let replies = self
            .backend
            .execute_batch(vec![
                BatchOp::PushTrimmed {
                    key: ENTRIES_KEY.to_string(),
                    value: raw,
                    max_len: self.config.max_size,
                },
                BatchOp::Expire {
                    key: ENTRIES_KEY.to_string(),
                    ttl: retention,
                },
                BatchOp::IncrBy {
                    key: TOTAL_KEY.to_string(),
                    delta: 1,
                },
                BatchOp::IncrBy {
                    key: format!("{}{}", CATEGORY_PREFIX, entry.error_category),
                    delta: 1,
                },
                BatchOp::IncrBy {
                    key: format!("{}{}", TYPE_PREFIX, entry.error_type),
                    delta: 1,
                },
            ])
            .await?;
        Ok(match replies.first() {
            Some(crate::storage::BatchReply::Length(len)) => *len,
            _ => 0,
        })
    }

    /// Entries newest first
    pub async fn list(&self, limit: usize, offset: usize) -> StorageResult<Vec<DeadLetterEntry>> {
        let Some((start, stop)) = page_bounds(offset, limit) else {
            return Ok(Vec::new());
        };
        let raw = self.backend.range(ENTRIES_KEY, start, stop).await?;
        Ok(decode_entries(raw))
    }

    pub async fn stats(&self) -> StorageResult<DlqStats> {
        let current_size = self.backend.list_len(ENTRIES_KEY).await?;
        let total_ever_admitted = self
            .backend
            .get(TOTAL_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(DlqStats {
            current_size,
            max_size: self.config.max_size,
            total_ever_admitted,
            by_category: self.counters(CATEGORY_PREFIX).await?,
            by_type: self.counters(TYPE_PREFIX).await?,
            health: DlqHealth::from_fill(current_size, self.config.max_size),
        })
    }

    async fn counters(&self, prefix: &str) -> StorageResult<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        for key in self.backend.scan_prefix(prefix).await? {
            if let Some(value) = self.backend.get(&key).await? {
                let name = key.trim_start_matches(prefix).to_string();
                out.insert(name, value.parse().unwrap_or(0));
            }
        }
        Ok(out)
    }

    /// Aggregate the newest `sample_size` entries
    pub async fn analyze_patterns(&self, sample_size: usize) -> StorageResult<PatternAnalysis> {
        let sample = self.list(sample_size, 0).await?;
        debug!("Analyzing {} dead letter entries", sample.len());
        Ok(analysis::analyze(&sample))
    }

    /// Remove exactly the entries whose `failed_at` precedes now minus `days`
    pub async fn purge_older_than(&self, days: u32) -> StorageResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.purge_before(cutoff).await
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let raw = self.backend.range(ENTRIES_KEY, 0, -1).await?;
        let mut purged = 0;
        for value in raw {
            let expired = match serde_json::from_str::<DeadLetterEntry>(&value) {
                Ok(entry) => entry.failed_at < cutoff,
                Err(e) => {
                    warn!("Dropping undecodable dead letter entry: {}", e);
                    true
                }
            };
            if expired {
                purged += self.backend.remove_value(ENTRIES_KEY, &value).await?;
            }
        }
        info!("Purged {} dead letter entries older than {}", purged, cutoff);
        Ok(purged)
    }

    /// Retention sweep over the configured window
    pub async fn sweep_expired(&self) -> StorageResult<usize> {
        self.purge_older_than(self.config.retention_days).await
    }

    /// Remove every entry and counter
    pub async fn clear(&self) -> bool {
        let result: StorageResult<usize> = async {
            let mut keys = vec![ENTRIES_KEY.to_string(), TOTAL_KEY.to_string()];
            keys.extend(self.backend.scan_prefix(CATEGORY_PREFIX).await?);
            keys.extend(self.backend.scan_prefix(TYPE_PREFIX).await?);
            let count = keys.len();
            self.backend
                .execute_batch(keys.into_iter().map(|key| BatchOp::Delete { key }).collect())
                .await?;
            Ok(count)
        }
        .await;

        match result {
            Ok(count) => {
                warn!("Cleared dead letter store ({} keys)", count);
                true
            }
            Err(e) => {
                error!("Failed to clear dead letter store: {}", e);
                false
            }
        }
    }
}

fn decode_entries(raw: Vec<String>) -> Vec<DeadLetterEntry> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_str(&value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping undecodable dead letter entry: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests;
