//! Priority job queue over the queue backend
//!
//! Ready work lives in one FIFO list per (queue, priority). Retries wait in a
//! single delayed list until `promote_due` moves them back; nothing sleeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::job::{JobRecord, Priority};
use crate::storage::{QueueBackend, StorageResult};

pub const READY_PREFIX: &str = "queue:ready:";
pub const DELAYED_KEY: &str = "queue:delayed";

/// What a ready list holds: enough to find the record in the job store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub queue_name: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            priority: job.priority,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayedEntry {
    entry: QueueEntry,
    ready_at: DateTime<Utc>,
}

pub fn ready_key(queue_name: &str, priority: Priority) -> String {
    format!("{}{}:{}", READY_PREFIX, queue_name, priority)
}

#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn enqueue(&self, job: &JobRecord) -> StorageResult<usize> {
        self.push_entry(&QueueEntry::for_job(job)).await
    }

    async fn push_entry(&self, entry: &QueueEntry) -> StorageResult<usize> {
        let raw = serde_json::to_string(entry)?;
        self.backend
            .push(&ready_key(&entry.queue_name, entry.priority), &raw)
            .await
    }

    /// Park a job until `ready_at`
    pub async fn schedule(&self, job: &JobRecord, ready_at: DateTime<Utc>) -> StorageResult<()> {
        let delayed = DelayedEntry {
            entry: QueueEntry::for_job(job),
            ready_at,
        };
        let raw = serde_json::to_string(&delayed)?;
        self.backend.push(DELAYED_KEY, &raw).await?;
        debug!("Scheduled job {} for {}", job.id, ready_at);
        Ok(())
    }

    /// Move every delayed entry that is due onto its ready list
    ///
    /// An entry is only pushed by the caller that removed it, so concurrent
    /// promoters cannot duplicate work.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut promoted = 0;
        for raw in self.backend.range(DELAYED_KEY, 0, -1).await? {
            let delayed: DelayedEntry = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Discarding undecodable delayed entry: {}", e);
                    self.backend.remove_value(DELAYED_KEY, &raw).await?;
                    continue;
                }
            };
            if delayed.ready_at > now {
                continue;
            }
            if self.backend.remove_value(DELAYED_KEY, &raw).await? > 0 {
                let mut entry = delayed.entry;
                entry.enqueued_at = now;
                self.push_entry(&entry).await?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!("Promoted {} delayed jobs", promoted);
        }
        Ok(promoted)
    }

    /// Pop the next entry across `queues`, highest priority first
    pub async fn pop_next(&self, queues: &[String]) -> StorageResult<Option<QueueEntry>> {
        for priority in Priority::DESCENDING {
            for queue in queues {
                if let Some(raw) = self.backend.pop(&ready_key(queue, priority)).await? {
                    match serde_json::from_str(&raw) {
                        Ok(entry) => return Ok(Some(entry)),
                        Err(e) => warn!("Discarding undecodable queue entry: {}", e),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Ready entries per queue name
    pub async fn depths(&self) -> StorageResult<BTreeMap<String, usize>> {
        let mut out = BTreeMap::new();
        for key in self.backend.scan_prefix(READY_PREFIX).await? {
            let Some((queue, _)) = key.trim_start_matches(READY_PREFIX).rsplit_once(':') else {
                continue;
            };
            let len = self.backend.list_len(&key).await?;
            *out.entry(queue.to_string()).or_insert(0) += len;
        }
        Ok(out)
    }

    pub async fn total_depth(&self) -> StorageResult<usize> {
        Ok(self.depths().await?.values().sum())
    }

    pub async fn delayed_len(&self) -> StorageResult<usize> {
        self.backend.list_len(DELAYED_KEY).await
    }

    /// Jobs parked for a later retry, with the time each becomes due
    pub async fn pending_retries(&self) -> StorageResult<Vec<(String, DateTime<Utc>)>> {
        Ok(self
            .backend
            .range(DELAYED_KEY, 0, -1)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str::<DelayedEntry>(raw).ok())
            .map(|d| (d.entry.job_id, d.ready_at))
            .collect())
    }

    /// Drop every ready entry, returning the job IDs that were queued
    pub async fn drain_ready(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        for key in self.backend.scan_prefix(READY_PREFIX).await? {
            while let Some(raw) = self.backend.pop(&key).await? {
                if let Ok(entry) = serde_json::from_str::<QueueEntry>(&raw) {
                    ids.push(entry.job_id);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use chrono::Duration as ChronoDuration;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryBackend::default()))
    }

    fn queues() -> Vec<String> {
        vec!["default".to_string(), "captions".to_string()]
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = queue();
        queue.enqueue(&JobRecord::new("low", 1, 1).with_priority(Priority::Low)).await.unwrap();
        queue.enqueue(&JobRecord::new("n1", 1, 1)).await.unwrap();
        queue.enqueue(&JobRecord::new("n2", 1, 1)).await.unwrap();
        queue
            .enqueue(&JobRecord::new("urgent", 1, 1).with_priority(Priority::Urgent).with_queue("captions"))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(entry) = queue.pop_next(&queues()).await.unwrap() {
            order.push(entry.job_id);
        }
        assert_eq!(order, vec!["urgent", "n1", "n2", "low"]);
    }

    #[tokio::test]
    async fn test_delayed_entries_wait_until_due() {
        let queue = queue();
        let now = Utc::now();
        let job = JobRecord::new("retry-me", 1, 1);
        queue.schedule(&job, now + ChronoDuration::seconds(30)).await.unwrap();

        assert_eq!(queue.promote_due(now).await.unwrap(), 0);
        assert!(queue.pop_next(&queues()).await.unwrap().is_none());
        let pending = queue.pending_retries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "retry-me");

        assert_eq!(queue.promote_due(now + ChronoDuration::seconds(31)).await.unwrap(), 1);
        assert_eq!(queue.delayed_len().await.unwrap(), 0);
        let entry = queue.pop_next(&queues()).await.unwrap().unwrap();
        assert_eq!(entry.job_id, "retry-me");
    }

    #[tokio::test]
    async fn test_depths_and_drain() {
        let queue = queue();
        queue.enqueue(&JobRecord::new("a", 1, 1)).await.unwrap();
        queue.enqueue(&JobRecord::new("b", 1, 1).with_priority(Priority::High)).await.unwrap();
        queue.enqueue(&JobRecord::new("c", 1, 1).with_queue("captions")).await.unwrap();

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.get("default"), Some(&2));
        assert_eq!(depths.get("captions"), Some(&1));
        assert_eq!(queue.total_depth().await.unwrap(), 3);

        let mut drained = queue.drain_ready().await.unwrap();
        drained.sort();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert_eq!(queue.total_depth().await.unwrap(), 0);
    }
}
