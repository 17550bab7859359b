//! In-memory job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::job::{JobRecord, JobStatus};
use crate::storage::{
    error::{StorageError, StorageResult},
    traits::JobStore,
};

/// In-memory job store with a connections table (connection id -> owner id)
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    connections: Arc<RwLock<HashMap<i64, i64>>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target connection as belonging to `owner_id`
    pub async fn add_connection(&self, connection_id: i64, owner_id: i64) {
        self.connections
            .write()
            .await
            .insert(connection_id, owner_id);
    }

    /// Toggle simulated reachability
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("memory job store marked unreachable"))
        } else {
            Ok(())
        }
    }
}

/// Timestamp a status count is measured against
fn status_timestamp(job: &JobRecord) -> DateTime<Utc> {
    if job.status.is_terminal() {
        job.completed_at.unwrap_or(job.created_at)
    } else {
        job.created_at
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> StorageResult<()> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::conflict(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update(&self, job: &JobRecord) -> StorageResult<()> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StorageError::not_found(format!("job {}", job.id))),
        }
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.check_available()?;
        Ok(self.jobs.read().await.contains_key(id))
    }

    async fn connection_owner(&self, connection_id: i64) -> StorageResult<Option<i64>> {
        self.check_available()?;
        Ok(self.connections.read().await.get(&connection_id).copied())
    }

    async fn connections_for_owner(&self, owner_id: i64) -> StorageResult<Vec<i64>> {
        self.check_available()?;
        let mut ids: Vec<i64> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, owner)| **owner == owner_id)
            .map(|(conn, _)| *conn)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        let mut matching: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.status == status)
            .filter(|job| since.is_none_or(|cutoff| job.created_at >= cutoff))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> StorageResult<Vec<JobRecord>> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| job.started_at.is_some_and(|at| at < started_before))
            .cloned()
            .collect())
    }

    async fn count_by_status_since(
        &self,
        status: JobStatus,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == status && status_timestamp(job) >= since)
            .count() as u64)
    }

    async fn processing_times_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<f64>> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Completed)
            .filter(|job| job.completed_at.is_some_and(|at| at >= since))
            .filter_map(|job| job.processing_duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect())
    }

    async fn ping(&self) -> StorageResult<Duration> {
        self.check_available()?;
        let start = Instant::now();
        let _guard = self.jobs.read().await;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = MemoryJobStore::new();
        let job = JobRecord::new("job-1", 5, 9);
        store.insert(&job).await.unwrap();
        let err = store.insert(&job).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemoryJobStore::new();
        let err = store
            .update(&JobRecord::new("ghost", 1, 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_stuck_only_returns_overdue_running_jobs() {
        let store = MemoryJobStore::new();
        let long_ago = Utc::now() - chrono::Duration::hours(3);

        let mut stuck = JobRecord::new("stuck", 1, 1);
        stuck.mark_running(long_ago).unwrap();
        let mut fresh = JobRecord::new("fresh", 1, 1);
        fresh.mark_running(Utc::now()).unwrap();
        store.insert(&stuck).await.unwrap();
        store.insert(&fresh).await.unwrap();
        store.insert(&JobRecord::new("queued", 1, 1)).await.unwrap();

        let found = store
            .find_stuck(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "stuck");
    }

    #[tokio::test]
    async fn test_connections_table() {
        let store = MemoryJobStore::new();
        store.add_connection(9, 5).await;
        store.add_connection(10, 5).await;
        store.add_connection(11, 6).await;
        assert_eq!(store.connection_owner(9).await.unwrap(), Some(5));
        assert_eq!(store.connection_owner(99).await.unwrap(), None);
        assert_eq!(store.connections_for_owner(5).await.unwrap(), vec![9, 10]);
    }

    #[tokio::test]
    async fn test_list_by_status_newest_first_with_limit() {
        let store = MemoryJobStore::new();
        for i in 0..3 {
            let mut job = JobRecord::new(format!("job-{}", i), 1, 1);
            job.created_at = Utc::now() - chrono::Duration::minutes(10 - i);
            store.insert(&job).await.unwrap();
        }
        let listed = store
            .list_by_status(JobStatus::Queued, None, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-2", "job-1"]);
    }
}
