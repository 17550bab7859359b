//! Scoped job-store sessions
//!
//! One session is acquired per unit of work and released when the guard drops,
//! whatever path the caller exits by. A background reaper revokes sessions that
//! sit idle past the configured timeout, and `force_cleanup` revokes everything
//! for emergency shutdown. A revoked session refuses every further operation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::traits::JobStore;
use crate::job::{JobRecord, JobStatus};

struct SessionSlot {
    holder: String,
    acquired_at: DateTime<Utc>,
    last_used: Arc<Mutex<Instant>>,
    revoked: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<HashMap<Uuid, SessionSlot>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Snapshot of one live session, for diagnostics
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub idle_for: Duration,
}

/// Hands out `JobSession` guards over a shared job store
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn JobStore>,
    registry: Registry,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn JobStore>, idle_timeout: Duration) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// The underlying store, for callers that do not need session scoping
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Acquire a session for one unit of work
    pub fn acquire(&self, holder: impl Into<String>) -> JobSession {
        let id = Uuid::new_v4();
        let holder = holder.into();
        let last_used = Arc::new(Mutex::new(Instant::now()));
        let revoked = Arc::new(AtomicBool::new(false));
        lock(&self.registry).insert(
            id,
            SessionSlot {
                holder: holder.clone(),
                acquired_at: Utc::now(),
                last_used: Arc::clone(&last_used),
                revoked: Arc::clone(&revoked),
            },
        );
        debug!("Session {} acquired by {}", id, holder);
        JobSession {
            id,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            last_used,
            revoked,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        lock(&self.registry)
            .iter()
            .map(|(id, slot)| SessionInfo {
                id: *id,
                holder: slot.holder.clone(),
                acquired_at: slot.acquired_at,
                idle_for: lock(&slot.last_used).elapsed(),
            })
            .collect()
    }

    /// Revoke and deregister sessions idle longer than the timeout
    pub fn reap_idle(&self) -> usize {
        let mut registry = lock(&self.registry);
        let idle: Vec<Uuid> = registry
            .iter()
            .filter(|(_, slot)| lock(&slot.last_used).elapsed() > self.idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            if let Some(slot) = registry.remove(id) {
                slot.revoked.store(true, Ordering::SeqCst);
                warn!(
                    "Reclaimed session {} held by {} after {:?} idle",
                    id, slot.holder, self.idle_timeout
                );
            }
        }
        idle.len()
    }

    /// Revoke every live session
    pub fn force_cleanup(&self) -> usize {
        let mut registry = lock(&self.registry);
        let count = registry.len();
        for (_, slot) in registry.drain() {
            slot.revoked.store(true, Ordering::SeqCst);
        }
        if count > 0 {
            warn!("Force-revoked {} sessions", count);
        }
        count
    }

    /// Run `reap_idle` every `interval` until the shutdown signal flips
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = manager.reap_idle();
                        if reaped > 0 {
                            info!("Session reaper reclaimed {} idle sessions", reaped);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Session reaper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// A scoped handle onto the job store; deregisters itself on drop
pub struct JobSession {
    id: Uuid,
    store: Arc<dyn JobStore>,
    registry: Registry,
    last_used: Arc<Mutex<Instant>>,
    revoked: Arc<AtomicBool>,
}

impl JobSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    fn touch(&self) -> StorageResult<&dyn JobStore> {
        if self.is_revoked() {
            return Err(StorageError::SessionRevoked(self.id.to_string()));
        }
        *lock(&self.last_used) = Instant::now();
        Ok(self.store.as_ref())
    }

    /// Mark the session as in use without touching the store
    pub fn keep_alive(&self) -> StorageResult<()> {
        self.touch().map(|_| ())
    }

    pub async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>> {
        self.touch()?.get(id).await
    }

    pub async fn insert(&self, job: &JobRecord) -> StorageResult<()> {
        self.touch()?.insert(job).await
    }

    pub async fn update(&self, job: &JobRecord) -> StorageResult<()> {
        self.touch()?.update(job).await
    }

    pub async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.touch()?.exists(id).await
    }

    pub async fn connection_owner(&self, connection_id: i64) -> StorageResult<Option<i64>> {
        self.touch()?.connection_owner(connection_id).await
    }

    pub async fn connections_for_owner(&self, owner_id: i64) -> StorageResult<Vec<i64>> {
        self.touch()?.connections_for_owner(owner_id).await
    }

    pub async fn list_by_status(
        &self,
        status: JobStatus,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        self.touch()?.list_by_status(status, since, limit).await
    }

    pub async fn find_stuck(&self, started_before: DateTime<Utc>) -> StorageResult<Vec<JobRecord>> {
        self.touch()?.find_stuck(started_before).await
    }
}

impl Drop for JobSession {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}
