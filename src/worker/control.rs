//! Worker control plane on the queue backend
//!
//! Each worker polls its own command list between jobs and publishes a
//! heartbeat with a TTL. Scale requests go to the supervisor list, which the
//! pool drains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::{get_json, set_json, QueueBackend, StorageResult};

pub const WORKER_CONTROL_PREFIX: &str = "control:workers:";
pub const SUPERVISOR_KEY: &str = "control:supervisor";
pub const HEARTBEAT_PREFIX: &str = "workers:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Finish the current job, then start a fresh loop
    Restart,
    /// Finish the current job, then exit
    Stop,
    /// Supervisor only: bring the pool to `target` workers
    Scale { target: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Halted,
    Stopping,
}

/// Liveness record a worker refreshes on every loop iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub name: String,
    pub queues: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub jobs_processed: u64,
    pub state: WorkerState,
}

#[derive(Clone)]
pub struct WorkerControl {
    backend: Arc<dyn QueueBackend>,
    heartbeat_ttl: Duration,
}

impl WorkerControl {
    pub fn new(backend: Arc<dyn QueueBackend>, heartbeat_ttl: Duration) -> Self {
        Self {
            backend,
            heartbeat_ttl,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    pub async fn publish_heartbeat(&self, heartbeat: &WorkerHeartbeat) {
        let key = format!("{}{}", HEARTBEAT_PREFIX, heartbeat.name);
        if let Err(e) = set_json(
            self.backend.as_ref(),
            &key,
            heartbeat,
            Some(self.heartbeat_ttl),
        )
        .await
        {
            warn!("Failed to publish heartbeat for {}: {}", heartbeat.name, e);
        }
    }

    pub async fn remove_heartbeat(&self, name: &str) {
        let key = format!("{}{}", HEARTBEAT_PREFIX, name);
        if let Err(e) = self.backend.delete(&key).await {
            debug!("Failed to remove heartbeat for {}: {}", name, e);
        }
    }

    /// Heartbeats that have not expired
    pub async fn heartbeats(&self) -> StorageResult<Vec<WorkerHeartbeat>> {
        let mut out = Vec::new();
        for key in self.backend.scan_prefix(HEARTBEAT_PREFIX).await? {
            if let Some(heartbeat) = get_json::<WorkerHeartbeat>(self.backend.as_ref(), &key).await?
            {
                out.push(heartbeat);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Queue a command for one worker
    pub async fn send(&self, worker: &str, command: WorkerCommand) -> StorageResult<()> {
        let raw = serde_json::to_string(&command)?;
        self.backend
            .push(&format!("{}{}", WORKER_CONTROL_PREFIX, worker), &raw)
            .await?;
        Ok(())
    }

    /// Queue `command` for every worker with a live heartbeat
    pub async fn broadcast(&self, command: WorkerCommand) -> StorageResult<usize> {
        let heartbeats = self.heartbeats().await?;
        for heartbeat in &heartbeats {
            self.send(&heartbeat.name, command).await?;
        }
        Ok(heartbeats.len())
    }

    pub async fn next_command(&self, worker: &str) -> StorageResult<Option<WorkerCommand>> {
        let key = format!("{}{}", WORKER_CONTROL_PREFIX, worker);
        self.pop_command(&key).await
    }

    pub async fn request_scale(&self, target: u32) -> StorageResult<()> {
        let raw = serde_json::to_string(&WorkerCommand::Scale { target })?;
        self.backend.push(SUPERVISOR_KEY, &raw).await?;
        Ok(())
    }

    pub async fn next_supervisor_command(&self) -> StorageResult<Option<WorkerCommand>> {
        self.pop_command(SUPERVISOR_KEY).await
    }

    async fn pop_command(&self, key: &str) -> StorageResult<Option<WorkerCommand>> {
        while let Some(raw) = self.backend.pop(key).await? {
            match serde_json::from_str(&raw) {
                Ok(command) => return Ok(Some(command)),
                Err(e) => warn!("Discarding undecodable control command on {}: {}", key, e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn control() -> WorkerControl {
        WorkerControl::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60))
    }

    fn heartbeat(name: &str) -> WorkerHeartbeat {
        WorkerHeartbeat {
            name: name.to_string(),
            queues: vec!["default".to_string()],
            last_seen: Utc::now(),
            jobs_processed: 0,
            state: WorkerState::Idle,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_live_workers() {
        let control = control();
        control.publish_heartbeat(&heartbeat("w1")).await;
        control.publish_heartbeat(&heartbeat("w2")).await;

        assert_eq!(control.broadcast(WorkerCommand::Restart).await.unwrap(), 2);
        assert_eq!(
            control.next_command("w1").await.unwrap(),
            Some(WorkerCommand::Restart)
        );
        assert_eq!(
            control.next_command("w2").await.unwrap(),
            Some(WorkerCommand::Restart)
        );
        assert_eq!(control.next_command("w1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_removed_heartbeat_is_not_listed() {
        let control = control();
        control.publish_heartbeat(&heartbeat("w1")).await;
        control.remove_heartbeat("w1").await;
        assert!(control.heartbeats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scale_requests_go_to_supervisor() {
        let control = control();
        control.request_scale(4).await.unwrap();
        assert_eq!(
            control.next_supervisor_command().await.unwrap(),
            Some(WorkerCommand::Scale { target: 4 })
        );
    }
}
