//! Core trait definitions for the storage layer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::error::StorageResult;
use super::types::{BackendInfo, BatchOp, BatchReply};
use crate::job::{JobRecord, JobStatus};

/// Durable list/KV store the queue, dead letter store, backups and caches live in
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a value to the tail of a list, returning the new length
    async fn push(&self, key: &str, value: &str) -> StorageResult<usize>;

    /// Pop a value from the head of a list
    async fn pop(&self, key: &str) -> StorageResult<Option<String>>;

    /// Atomically prepend a value and trim the list to `max_len` entries
    async fn push_trimmed(&self, key: &str, value: &str, max_len: usize) -> StorageResult<usize>;

    /// Inclusive range read; negative `stop` counts from the tail
    async fn range(&self, key: &str, start: isize, stop: isize) -> StorageResult<Vec<String>>;

    /// Length of a list (zero when absent)
    async fn list_len(&self, key: &str) -> StorageResult<usize>;

    /// Remove every occurrence of `value` from a list, returning how many went
    async fn remove_value(&self, key: &str, value: &str) -> StorageResult<usize>;

    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64>;

    /// All live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Execute the operations atomically, in order
    async fn execute_batch(&self, ops: Vec<BatchOp>) -> StorageResult<Vec<BatchReply>>;

    /// Round-trip latency
    async fn ping(&self) -> StorageResult<Duration>;

    async fn info(&self) -> StorageResult<BackendInfo>;

    /// Drop and re-establish connections
    async fn reconnect(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Transactional store of job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record; duplicate IDs are a conflict
    async fn insert(&self, job: &JobRecord) -> StorageResult<()>;

    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>>;

    /// Replace an existing record; missing IDs are not found
    async fn update(&self, job: &JobRecord) -> StorageResult<()>;

    async fn exists(&self, id: &str) -> StorageResult<bool>;

    /// Owner of a target connection, if the connection exists
    async fn connection_owner(&self, connection_id: i64) -> StorageResult<Option<i64>>;

    async fn connections_for_owner(&self, owner_id: i64) -> StorageResult<Vec<i64>>;

    /// Records in `status`, created at or after `since`, newest first
    async fn list_by_status(
        &self,
        status: JobStatus,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>>;

    /// Running records whose start precedes `started_before`
    async fn find_stuck(&self, started_before: DateTime<Utc>) -> StorageResult<Vec<JobRecord>>;

    /// Records in `status` whose completion (or creation, for non-terminal
    /// statuses) falls at or after `since`
    async fn count_by_status_since(
        &self,
        status: JobStatus,
        since: DateTime<Utc>,
    ) -> StorageResult<u64>;

    /// Processing durations (seconds) of jobs completed since `since`
    async fn processing_times_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<f64>>;

    /// Lightweight connectivity probe
    async fn ping(&self) -> StorageResult<Duration>;
}
