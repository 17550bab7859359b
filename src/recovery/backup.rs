//! Point-in-time backups of a job's critical fields

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dlq::sanitize_message;
use crate::job::integrity::sha256_hex;
use crate::job::{JobRecord, JobStatus, Priority};
use crate::storage::{get_json, set_json, QueueBackend, StorageResult};

pub const BACKUP_PREFIX: &str = "backup:";

const LAST_ERROR_MAX_LEN: usize = 200;

/// Snapshot of a job, replaced wholesale on every backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub job_id: String,
    pub owner_id: i64,
    pub connection_id: i64,
    pub status: JobStatus,
    pub priority: Priority,
    pub settings: Map<String, Value>,
    pub queue_name: String,
    pub retry_count: u32,
    pub job_created_at: DateTime<Utc>,
    pub integrity_hash: Option<String>,
    /// Sanitized
    pub last_error: Option<String>,
    pub backed_up_at: DateTime<Utc>,
    /// SHA-256 over the fields above
    pub checksum: String,
}

impl BackupSnapshot {
    pub fn capture(job: &JobRecord) -> Self {
        let mut snapshot = Self {
            job_id: job.id.clone(),
            owner_id: job.owner_id,
            connection_id: job.connection_id,
            status: job.status,
            priority: job.priority,
            settings: job.settings.clone(),
            queue_name: job.queue_name.clone(),
            retry_count: job.retry_count,
            job_created_at: job.created_at,
            integrity_hash: job.integrity_hash.clone(),
            last_error: job
                .error_message
                .last()
                .map(|e| sanitize_message(&e.message, LAST_ERROR_MAX_LEN)),
            backed_up_at: Utc::now(),
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.compute_checksum();
        snapshot
    }

    fn compute_checksum(&self) -> String {
        let canonical = json!({
            "job_id": self.job_id,
            "owner_id": self.owner_id,
            "connection_id": self.connection_id,
            "status": self.status,
            "priority": self.priority,
            "settings": self.settings,
            "queue_name": self.queue_name,
            "retry_count": self.retry_count,
            "job_created_at": self.job_created_at,
            "integrity_hash": self.integrity_hash,
            "last_error": self.last_error,
            "backed_up_at": self.backed_up_at,
        });
        sha256_hex(canonical.to_string().as_bytes())
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Overwrite the mutable fields of `job` with the snapshot's values
    pub fn apply_to(&self, job: &mut JobRecord) {
        job.owner_id = self.owner_id;
        job.connection_id = self.connection_id;
        job.priority = self.priority;
        job.settings = self.settings.clone();
        job.queue_name = self.queue_name.clone();
        job.integrity_hash = self.integrity_hash.clone();
    }

    /// Rebuild a queued record when the live one is gone
    pub fn to_record(&self) -> JobRecord {
        let mut job = JobRecord::new(&self.job_id, self.owner_id, self.connection_id);
        self.apply_to(&mut job);
        job.created_at = self.job_created_at;
        job.retry_count = self.retry_count;
        job
    }
}

#[derive(Clone)]
pub struct BackupStore {
    backend: Arc<dyn QueueBackend>,
    ttl: Duration,
}

impl BackupStore {
    pub fn new(backend: Arc<dyn QueueBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(job_id: &str) -> String {
        format!("{}{}", BACKUP_PREFIX, job_id)
    }

    /// Snapshot `job`. Best-effort: a failed backup never fails the job.
    pub async fn create(&self, job: &JobRecord) -> bool {
        let snapshot = BackupSnapshot::capture(job);
        match set_json(
            self.backend.as_ref(),
            &Self::key(&job.id),
            &snapshot,
            Some(self.ttl),
        )
        .await
        {
            Ok(()) => {
                debug!("Backed up job {}", job.id);
                true
            }
            Err(e) => {
                warn!("Failed to back up job {}: {}", job.id, e);
                false
            }
        }
    }

    pub async fn latest(&self, job_id: &str) -> StorageResult<Option<BackupSnapshot>> {
        get_json(self.backend.as_ref(), &Self::key(job_id)).await
    }

    pub async fn delete(&self, job_id: &str) -> StorageResult<bool> {
        self.backend.delete(&Self::key(job_id)).await
    }

    /// IDs of every job with a live backup
    pub async fn job_ids(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .backend
            .scan_prefix(BACKUP_PREFIX)
            .await?
            .into_iter()
            .map(|k| k.trim_start_matches(BACKUP_PREFIX).to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[tokio::test]
    async fn test_backup_round_trip_verifies() {
        let store = BackupStore::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
        let job = JobRecord::new("job-1", 5, 9);
        assert!(store.create(&job).await);

        let snapshot = store.latest("job-1").await.unwrap().unwrap();
        assert!(snapshot.verify());
        assert_eq!(snapshot.to_record().settings, job.settings);
        assert_eq!(store.job_ids().await.unwrap(), vec!["job-1"]);
    }

    #[test]
    fn test_tampered_snapshot_fails_verification() {
        let mut snapshot = BackupSnapshot::capture(&JobRecord::new("job-1", 5, 9));
        snapshot.owner_id = 6;
        assert!(!snapshot.verify());
    }

    #[tokio::test]
    async fn test_create_is_best_effort() {
        let backend = Arc::new(MemoryBackend::default());
        backend.set_available(false);
        let store = BackupStore::new(backend, Duration::from_secs(60));
        assert!(!store.create(&JobRecord::new("job-1", 5, 9)).await);
    }
}
