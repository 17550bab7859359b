//! Recovery actions and their static documentation

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use super::Orchestrator;
use crate::job::{ErrorRecord, JobStatus};
use crate::retry::{strategy_for, BackoffStrategy, FaultCategory};
use crate::worker::WorkerCommand;

/// Queued/failed records touched per migration or retry sweep
const SWEEP_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartWorkers,
    ClearStuckTasks,
    MigrateToFallbackStore,
    MigrateBackToQueue,
    ClearDeadLetterQueue,
    RetryFailedTasks,
    ResetBackendConnection,
    CleanupResources,
    /// Target pool size
    ScaleWorkers(u32),
    EmergencyShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDoc {
    pub name: String,
    pub description: String,
    pub when_to_use: String,
    pub risk: RiskLevel,
}

impl RecoveryAction {
    /// One of each action; scaling is listed with a zero placeholder target
    pub fn catalog() -> [RecoveryAction; 10] {
        [
            RecoveryAction::RestartWorkers,
            RecoveryAction::ClearStuckTasks,
            RecoveryAction::MigrateToFallbackStore,
            RecoveryAction::MigrateBackToQueue,
            RecoveryAction::ClearDeadLetterQueue,
            RecoveryAction::RetryFailedTasks,
            RecoveryAction::ResetBackendConnection,
            RecoveryAction::CleanupResources,
            RecoveryAction::ScaleWorkers(0),
            RecoveryAction::EmergencyShutdown,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecoveryAction::RestartWorkers => "restart_workers",
            RecoveryAction::ClearStuckTasks => "clear_stuck_tasks",
            RecoveryAction::MigrateToFallbackStore => "migrate_to_fallback_store",
            RecoveryAction::MigrateBackToQueue => "migrate_back_to_queue",
            RecoveryAction::ClearDeadLetterQueue => "clear_dead_letter_queue",
            RecoveryAction::RetryFailedTasks => "retry_failed_tasks",
            RecoveryAction::ResetBackendConnection => "reset_backend_connection",
            RecoveryAction::CleanupResources => "cleanup_resources",
            RecoveryAction::ScaleWorkers(_) => "scale_workers",
            RecoveryAction::EmergencyShutdown => "emergency_shutdown",
        }
    }

    pub fn doc(&self) -> ActionDoc {
        let (description, when_to_use, risk) = match self {
            RecoveryAction::RestartWorkers => (
                "Ask every live worker to finish its current job and start a fresh loop",
                "Workers look wedged or hold stale connections",
                RiskLevel::Low,
            ),
            RecoveryAction::ClearStuckTasks => (
                "Mark running jobs older than the stuck threshold as failed",
                "Diagnosis reports stuck tasks after a worker crash",
                RiskLevel::Medium,
            ),
            RecoveryAction::MigrateToFallbackStore => (
                "Drain ready queues and let workers read queued jobs from the job store",
                "The queue backend is unreachable or losing data",
                RiskLevel::High,
            ),
            RecoveryAction::MigrateBackToQueue => (
                "Re-queue every queued job from the job store and leave fallback mode",
                "The queue backend is healthy again after a fallback",
                RiskLevel::Medium,
            ),
            RecoveryAction::ClearDeadLetterQueue => (
                "Delete every dead letter entry and its counters",
                "Dead letters were analyzed and are no longer needed",
                RiskLevel::High,
            ),
            RecoveryAction::RetryFailedTasks => (
                "Reopen recently failed jobs whose failure category is retryable and queue them again",
                "A transient outage caused a burst of permanent failures",
                RiskLevel::Medium,
            ),
            RecoveryAction::ResetBackendConnection => (
                "Drop and re-establish the queue backend connection pool",
                "Backend calls fail while the backend itself is up",
                RiskLevel::Low,
            ),
            RecoveryAction::CleanupResources => (
                "Sweep expired dead letters, stale backups, old audit entries and idle sessions",
                "Backend memory is high or sessions are leaking",
                RiskLevel::Low,
            ),
            RecoveryAction::ScaleWorkers(_) => (
                "Ask the worker supervisor to run N workers (scale_workers:N)",
                "The backlog grows faster than it drains",
                RiskLevel::Medium,
            ),
            RecoveryAction::EmergencyShutdown => (
                "Halt processing, force fallback mode, stop workers and revoke all sessions",
                "Data corruption is spreading or the system is in an unknown state",
                RiskLevel::Critical,
            ),
        };
        ActionDoc {
            name: self.name().to_string(),
            description: description.to_string(),
            when_to_use: when_to_use.to_string(),
            risk,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::ScaleWorkers(n) => write!(f, "scale_workers:{}", n),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(target) = s.strip_prefix("scale_workers:") {
            return target
                .parse::<u32>()
                .map(RecoveryAction::ScaleWorkers)
                .map_err(|_| format!("invalid worker count '{}'", target));
        }
        if s == "scale_workers" {
            return Err("scale_workers needs a target, e.g. scale_workers:4".to_string());
        }
        RecoveryAction::catalog()
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| format!("unknown recovery action '{}'", s))
    }
}

/// What a successful action reports back
pub(crate) struct ActionOutcome {
    pub message: String,
    pub details: Value,
}

impl ActionOutcome {
    fn new(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }
}

fn is_retryable(category: FaultCategory) -> bool {
    strategy_for(category) != BackoffStrategy::NoRetry
}

impl Orchestrator {
    pub(crate) async fn run_action(&self, action: RecoveryAction) -> Result<ActionOutcome> {
        match action {
            RecoveryAction::RestartWorkers => self.restart_workers().await,
            RecoveryAction::ClearStuckTasks => self.clear_stuck_tasks().await,
            RecoveryAction::MigrateToFallbackStore => self.migrate_to_fallback().await,
            RecoveryAction::MigrateBackToQueue => self.migrate_back_to_queue().await,
            RecoveryAction::ClearDeadLetterQueue => self.clear_dead_letters().await,
            RecoveryAction::RetryFailedTasks => self.retry_failed_tasks().await,
            RecoveryAction::ResetBackendConnection => self.reset_backend_connection().await,
            RecoveryAction::CleanupResources => self.cleanup_resources().await,
            RecoveryAction::ScaleWorkers(target) => self.scale_workers(target).await,
            RecoveryAction::EmergencyShutdown => self.emergency_shutdown().await,
        }
    }

    async fn restart_workers(&self) -> Result<ActionOutcome> {
        let count = self
            .control
            .broadcast(WorkerCommand::Restart)
            .await
            .context("Failed to send restart commands")?;
        Ok(ActionOutcome::new(
            format!("restart requested for {} workers", count),
            json!({ "workers": count }),
        ))
    }

    async fn clear_stuck_tasks(&self) -> Result<ActionOutcome> {
        let session = self.sessions.acquire("orchestrator");
        let threshold = self.config.stuck_threshold;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).context("Stuck threshold out of range")?;
        let stuck = session
            .find_stuck(cutoff)
            .await
            .context("Failed to query stuck tasks")?;

        let mut cleared = Vec::new();
        for mut job in stuck {
            let now = Utc::now();
            let record = ErrorRecord {
                occurred_at: now,
                error_type: "StuckTaskTimeout".to_string(),
                category: FaultCategory::SystemError,
                message: format!(
                    "running for more than {}s, failed by the stuck-task sweep",
                    threshold.as_secs()
                ),
                attempt: job.retry_count,
                terminal: true,
            };
            if let Err(e) = job.mark_failed(now, record) {
                warn!("Skipping stuck job {}: {}", job.id, e);
                continue;
            }
            session
                .update(&job)
                .await
                .with_context(|| format!("Failed to fail stuck job {}", job.id))?;
            cleared.push(job.id);
        }
        info!("Cleared {} stuck tasks", cleared.len());
        Ok(ActionOutcome::new(
            format!("marked {} stuck jobs failed", cleared.len()),
            json!({ "job_ids": cleared }),
        ))
    }

    async fn migrate_to_fallback(&self) -> Result<ActionOutcome> {
        self.flags.set_fallback_mode(true);
        // Drained IDs stay Queued in the store, where fallback workers find them
        match self.queue.drain_ready().await {
            Ok(ids) => Ok(ActionOutcome::new(
                format!("fallback mode on, drained {} ready entries", ids.len()),
                json!({ "drained": ids.len() }),
            )),
            Err(e) => Ok(ActionOutcome::new(
                "fallback mode on, ready queues not drained",
                json!({ "drain_error": e.to_string() }),
            )),
        }
    }

    async fn migrate_back_to_queue(&self) -> Result<ActionOutcome> {
        self.backend
            .ping()
            .await
            .context("Queue backend is still unreachable")?;
        let parked: HashSet<String> = self
            .queue
            .pending_retries()
            .await
            .context("Failed to read the retry schedule")?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let session = self.sessions.acquire("orchestrator");
        let queued = session
            .list_by_status(JobStatus::Queued, None, SWEEP_LIMIT)
            .await
            .context("Failed to list queued jobs")?;

        let mut requeued = 0usize;
        for job in queued.iter().rev().filter(|j| !parked.contains(&j.id)) {
            self.queue
                .enqueue(job)
                .await
                .with_context(|| format!("Failed to re-queue job {}", job.id))?;
            requeued += 1;
        }
        self.flags.set_fallback_mode(false);
        Ok(ActionOutcome::new(
            format!("re-queued {} jobs, fallback mode off", requeued),
            json!({ "requeued": requeued, "parked_retries": parked.len() }),
        ))
    }

    async fn clear_dead_letters(&self) -> Result<ActionOutcome> {
        let before = self.dlq.stats().await.map(|s| s.current_size).unwrap_or(0);
        if !self.dlq.clear().await {
            bail!("dead letter store could not be cleared");
        }
        Ok(ActionOutcome::new(
            format!("cleared {} dead letter entries", before),
            json!({ "cleared": before }),
        ))
    }

    async fn retry_failed_tasks(&self) -> Result<ActionOutcome> {
        let session = self.sessions.acquire("orchestrator");
        let since = Utc::now()
            - chrono::Duration::from_std(self.config.retry_failed_window)
                .context("Retry window out of range")?;
        let failed = session
            .list_by_status(JobStatus::Failed, Some(since), self.config.retry_failed_limit)
            .await
            .context("Failed to list failed jobs")?;

        let mut retried = Vec::new();
        let mut skipped = 0usize;
        for mut job in failed {
            let retryable = job
                .error_message
                .last()
                .is_some_and(|record| is_retryable(record.category));
            if !retryable {
                skipped += 1;
                continue;
            }
            job.reopen()?;
            session
                .update(&job)
                .await
                .with_context(|| format!("Failed to reopen job {}", job.id))?;
            if !self.flags.fallback_mode() {
                self.queue
                    .enqueue(&job)
                    .await
                    .with_context(|| format!("Failed to queue reopened job {}", job.id))?;
            }
            retried.push(job.id);
        }
        Ok(ActionOutcome::new(
            format!(
                "reopened {} failed jobs, skipped {} with non-retryable failures",
                retried.len(),
                skipped
            ),
            json!({ "job_ids": retried, "skipped": skipped }),
        ))
    }

    async fn reset_backend_connection(&self) -> Result<ActionOutcome> {
        self.backend
            .reconnect()
            .await
            .context("Failed to reconnect to the queue backend")?;
        let latency = self
            .backend
            .ping()
            .await
            .context("Queue backend unreachable after reconnect")?;
        Ok(ActionOutcome::new(
            format!("reconnected, ping {}ms", latency.as_millis()),
            json!({ "latency_ms": latency.as_millis() as u64 }),
        ))
    }

    async fn cleanup_resources(&self) -> Result<ActionOutcome> {
        let expired = self
            .dlq
            .sweep_expired()
            .await
            .context("Failed to sweep expired dead letters")?;

        let session = self.sessions.acquire("orchestrator");
        let backups = self.recovery.backups();
        let mut stale_backups = 0usize;
        for job_id in backups.job_ids().await.context("Failed to list backups")? {
            let stale = match session.get(&job_id).await {
                Ok(Some(job)) => job.status == JobStatus::Completed,
                Ok(None) => true,
                Err(e) => {
                    warn!("Keeping backup of {}: {}", job_id, e);
                    false
                }
            };
            if stale && backups.delete(&job_id).await.unwrap_or(false) {
                stale_backups += 1;
            }
        }
        drop(session);

        let audit = self.recovery.audit();
        let trimmed = audit
            .truncate(audit.max_entries())
            .await
            .context("Failed to trim the recovery audit log")?;
        let reaped = self.sessions.reap_idle();

        Ok(ActionOutcome::new(
            format!(
                "removed {} expired dead letters, {} stale backups, {} audit entries, {} idle sessions",
                expired, stale_backups, trimmed, reaped
            ),
            json!({
                "expired_dead_letters": expired,
                "stale_backups": stale_backups,
                "audit_entries_trimmed": trimmed,
                "idle_sessions": reaped,
            }),
        ))
    }

    async fn scale_workers(&self, target: u32) -> Result<ActionOutcome> {
        if target == 0 {
            bail!("refusing to scale to zero workers, use emergency_shutdown to stop processing");
        }
        self.control
            .request_scale(target)
            .await
            .context("Failed to send scale command")?;
        Ok(ActionOutcome::new(
            format!("scale to {} workers requested", target),
            json!({ "target": target }),
        ))
    }

    async fn emergency_shutdown(&self) -> Result<ActionOutcome> {
        self.flags.set_processing_halted(true);
        self.flags.set_fallback_mode(true);
        let stopped = match self.control.broadcast(WorkerCommand::Stop).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not broadcast stop to workers: {}", e);
                0
            }
        };
        let revoked = self.sessions.force_cleanup();
        warn!(
            "Emergency shutdown: processing halted, {} workers told to stop, {} sessions revoked",
            stopped, revoked
        );
        Ok(ActionOutcome::new(
            format!(
                "processing halted, fallback mode on, {} workers stopping, {} sessions revoked",
                stopped, revoked
            ),
            json!({ "workers_stopped": stopped, "sessions_revoked": revoked }),
        ))
    }
}
