//! System-wide diagnosis and operator-driven recovery
//!
//! The orchestrator never runs from a worker's hot path. An operator (or the
//! monitor, when automated recovery is enabled) asks for a diagnosis and then
//! executes an ordered plan of recovery actions. Each action runs in
//! isolation: a failed action is recorded and the plan moves on.

pub mod actions;
pub mod diagnosis;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub use actions::{ActionDoc, RecoveryAction, RiskLevel};
pub use diagnosis::{ComponentReport, DiagnosisReport, HealthLevel, Issue};

use crate::config::OrchestratorConfig;
use crate::dlq::DeadLetterStore;
use crate::job::JobStatus;
use crate::recovery::RecoveryEngine;
use crate::storage::{QueueBackend, SessionManager};
use crate::worker::{JobQueue, RuntimeFlags, WorkerControl};

pub const PLAN_LOG_KEY: &str = "orchestrator:plans";
const PLAN_LOG_MAX: usize = 100;

/// Point-in-time view of the system recorded around a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub backend_reachable: bool,
    pub store_reachable: bool,
    pub queue_depth: Option<usize>,
    pub delayed_retries: Option<usize>,
    pub dead_letters: Option<usize>,
    pub running_jobs: Option<usize>,
    pub live_workers: Option<usize>,
    pub active_sessions: usize,
    pub fallback_mode: bool,
    pub processing_halted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: RecoveryAction,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub results: Vec<ActionResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub overall_status: PlanStatus,
    pub before: SystemSnapshot,
    pub after: SystemSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Arc<dyn QueueBackend>,
    sessions: SessionManager,
    queue: JobQueue,
    dlq: Arc<DeadLetterStore>,
    recovery: Arc<RecoveryEngine>,
    control: WorkerControl,
    flags: RuntimeFlags,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn QueueBackend>,
        sessions: SessionManager,
        queue: JobQueue,
        dlq: Arc<DeadLetterStore>,
        recovery: Arc<RecoveryEngine>,
        control: WorkerControl,
        flags: RuntimeFlags,
    ) -> Self {
        Self {
            config,
            backend,
            sessions,
            queue,
            dlq,
            recovery,
            control,
            flags,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// Static documentation for every action
    pub fn action_docs() -> Vec<ActionDoc> {
        RecoveryAction::catalog().iter().map(|a| a.doc()).collect()
    }

    pub async fn snapshot(&self) -> SystemSnapshot {
        let store = self.sessions.store();
        let backend_reachable = self.backend.ping().await.is_ok();
        let store_reachable = store.ping().await.is_ok();

        let (queue_depth, delayed_retries, dead_letters, live_workers) = if backend_reachable {
            (
                self.queue.total_depth().await.ok(),
                self.queue.delayed_len().await.ok(),
                self.dlq.stats().await.ok().map(|s| s.current_size),
                self.control.heartbeats().await.ok().map(|h| h.len()),
            )
        } else {
            (None, None, None, None)
        };
        let running_jobs = if store_reachable {
            store
                .list_by_status(JobStatus::Running, None, usize::MAX)
                .await
                .ok()
                .map(|jobs| jobs.len())
        } else {
            None
        };

        SystemSnapshot {
            timestamp: Utc::now(),
            backend_reachable,
            store_reachable,
            queue_depth,
            delayed_retries,
            dead_letters,
            running_jobs,
            live_workers,
            active_sessions: self.sessions.active_count(),
            fallback_mode: self.flags.fallback_mode(),
            processing_halted: self.flags.processing_halted(),
        }
    }

    /// Run `actions` in order, isolating each one
    pub async fn execute_plan(&self, actions: &[RecoveryAction]) -> PlanReport {
        let started_at = Utc::now();
        let plan_id = uuid::Uuid::new_v4().to_string();
        info!("Executing recovery plan {} ({} actions)", plan_id, actions.len());
        let before = self.snapshot().await;

        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let clock = Instant::now();
            let result = match self.run_action(*action).await {
                Ok(outcome) => {
                    info!("Recovery action {} succeeded: {}", action, outcome.message);
                    ActionResult {
                        action: *action,
                        success: true,
                        message: outcome.message,
                        details: outcome.details,
                        duration_ms: clock.elapsed().as_millis() as u64,
                    }
                }
                Err(e) => {
                    error!("Recovery action {} failed: {:#}", action, e);
                    ActionResult {
                        action: *action,
                        success: false,
                        message: format!("{:#}", e),
                        details: Value::Null,
                        duration_ms: clock.elapsed().as_millis() as u64,
                    }
                }
            };
            results.push(result);
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        let overall_status = match (success_count, failure_count) {
            (_, 0) => PlanStatus::Success,
            (0, _) => PlanStatus::Failed,
            _ => PlanStatus::PartialSuccess,
        };

        let report = PlanReport {
            plan_id,
            results,
            success_count,
            failure_count,
            overall_status,
            before,
            after: self.snapshot().await,
            started_at,
            finished_at: Utc::now(),
        };
        self.record_plan(&report).await;
        report
    }

    /// Most recent executed plans, newest first
    pub async fn recent_plans(&self, limit: usize) -> crate::storage::StorageResult<Vec<PlanReport>> {
        let Some((start, stop)) = crate::storage::page_bounds(0, limit) else {
            return Ok(Vec::new());
        };
        let raw = self.backend.range(PLAN_LOG_KEY, start, stop).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    async fn record_plan(&self, report: &PlanReport) {
        let raw = match serde_json::to_string(report) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode plan report {}: {}", report.plan_id, e);
                return;
            }
        };
        if let Err(e) = self
            .backend
            .push_trimmed(PLAN_LOG_KEY, &raw, PLAN_LOG_MAX)
            .await
        {
            warn!("Failed to record plan report {}: {}", report.plan_id, e);
        }
    }
}

#[cfg(test)]
mod tests;
