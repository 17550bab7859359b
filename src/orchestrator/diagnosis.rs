//! Health checks behind `Orchestrator::diagnose`
//!
//! Each component check is independent and bounded by the probe timeout; a
//! hung dependency shows up as an issue instead of stalling the report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{Orchestrator, RecoveryAction};
use crate::dlq::DlqHealth;
use crate::job::JobStatus;
use crate::storage::StorageResult;

pub const COMPONENT_BACKEND: &str = "queue_backend";
pub const COMPONENT_STORE: &str = "job_store";
pub const COMPONENT_QUEUE: &str = "queue";
pub const COMPONENT_WORKERS: &str = "workers";
pub const COMPONENT_PERFORMANCE: &str = "performance";

const MEMORY_DEGRADED_PERCENT: f64 = 80.0;
const MEMORY_UNHEALTHY_PERCENT: f64 = 90.0;
const STUCK_UNHEALTHY_COUNT: usize = 10;
const FAILURE_RATE_DEGRADED: f64 = 20.0;
const FAILURE_RATE_UNHEALTHY: f64 = 50.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub component: String,
    pub severity: HealthLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    pub health: HealthLevel,
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub overall_health: HealthLevel,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
    /// Actions an operator may want to put in a plan, deduplicated
    pub suggested_actions: Vec<RecoveryAction>,
    pub components: BTreeMap<String, ComponentReport>,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosisReport {
    pub fn issues_for<'a>(&'a self, component: &'a str) -> impl Iterator<Item = &'a Issue> {
        self.issues.iter().filter(move |i| i.component == component)
    }
}

/// Accumulates one component's findings
struct Check {
    component: &'static str,
    report: ComponentReport,
    issues: Vec<Issue>,
    recommendations: Vec<String>,
    actions: Vec<RecoveryAction>,
}

impl Check {
    fn new(component: &'static str) -> Self {
        Self {
            component,
            report: ComponentReport::default(),
            issues: Vec::new(),
            recommendations: Vec::new(),
            actions: Vec::new(),
        }
    }

    fn issue(&mut self, severity: HealthLevel, message: impl Into<String>) {
        self.report.health = self.report.health.max(severity);
        self.issues.push(Issue {
            component: self.component.to_string(),
            severity,
            message: message.into(),
        });
    }

    fn recommend(&mut self, text: impl Into<String>, action: Option<RecoveryAction>) {
        self.recommendations.push(text.into());
        if let Some(action) = action {
            self.actions.push(action);
        }
    }

    fn detail(&mut self, key: &str, value: impl Into<Value>) {
        self.report.details.insert(key.to_string(), value.into());
    }
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

impl Orchestrator {
    /// Check every component and fold the results into one report
    pub async fn diagnose(&self) -> DiagnosisReport {
        let checks = vec![
            self.check_backend().await,
            self.check_store().await,
            self.check_queue().await,
            self.check_workers().await,
            self.check_performance().await,
        ];

        let mut report = DiagnosisReport {
            overall_health: HealthLevel::Healthy,
            issues: Vec::new(),
            recommendations: Vec::new(),
            suggested_actions: Vec::new(),
            components: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        for check in checks {
            report.overall_health = report.overall_health.max(check.report.health);
            report.issues.extend(check.issues);
            report.recommendations.extend(check.recommendations);
            for action in check.actions {
                if !report.suggested_actions.contains(&action) {
                    report.suggested_actions.push(action);
                }
            }
            report
                .components
                .insert(check.component.to_string(), check.report);
        }

        info!(
            "Diagnosis finished: {} ({} issues)",
            report.overall_health,
            report.issues.len()
        );
        report
    }

    /// Await a storage call under the probe timeout
    async fn probe<T>(&self, fut: impl Future<Output = StorageResult<T>>) -> Result<T, String> {
        match tokio::time::timeout(self.config.probe_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no answer within {}ms",
                self.config.probe_timeout.as_millis()
            )),
        }
    }

    async fn check_backend(&self) -> Check {
        let mut check = Check::new(COMPONENT_BACKEND);
        let latency = match self.probe(self.backend.ping()).await {
            Ok(latency) => latency,
            Err(e) => {
                check.detail("reachable", false);
                check.issue(HealthLevel::Critical, format!("queue backend unreachable: {}", e));
                check.recommend(
                    "Switch workers to the job store until the queue backend is back",
                    Some(RecoveryAction::MigrateToFallbackStore),
                );
                check.recommend(
                    "Re-establish the queue backend connection",
                    Some(RecoveryAction::ResetBackendConnection),
                );
                return check;
            }
        };
        check.detail("reachable", true);
        check.detail("latency_ms", millis(latency));
        if latency > self.config.backend_latency_warning {
            check.issue(
                HealthLevel::Degraded,
                format!("queue backend latency {}ms", latency.as_millis()),
            );
        }

        match self.probe(self.backend.info()).await {
            Ok(info) => {
                check.detail("backend_type", info.backend_type.clone());
                check.detail("used_memory_bytes", info.used_memory_bytes);
                check.detail("connected_clients", info.connected_clients);
                if let Some(percent) = info.memory_usage_percent() {
                    check.detail("memory_usage_percent", (percent * 100.0).round() / 100.0);
                    if percent >= MEMORY_UNHEALTHY_PERCENT {
                        check.issue(
                            HealthLevel::Unhealthy,
                            format!("queue backend memory at {:.1}%", percent),
                        );
                        check.recommend(
                            "Free backend memory by sweeping expired entries",
                            Some(RecoveryAction::CleanupResources),
                        );
                    } else if percent >= MEMORY_DEGRADED_PERCENT {
                        check.issue(
                            HealthLevel::Degraded,
                            format!("queue backend memory at {:.1}%", percent),
                        );
                    }
                }
            }
            Err(e) => debug!("Backend info unavailable: {}", e),
        }
        check
    }

    async fn check_store(&self) -> Check {
        let mut check = Check::new(COMPONENT_STORE);
        let store = self.sessions.store();
        let latency = match self.probe(store.ping()).await {
            Ok(latency) => latency,
            Err(e) => {
                check.detail("reachable", false);
                check.issue(HealthLevel::Critical, format!("job store unreachable: {}", e));
                check.recommend("Check the job store connection and credentials", None);
                return check;
            }
        };
        check.detail("reachable", true);
        check.detail("latency_ms", millis(latency));
        check.detail("active_sessions", self.sessions.active_count());
        if latency > self.config.store_latency_warning {
            check.issue(
                HealthLevel::Degraded,
                format!("job store query latency {}ms", latency.as_millis()),
            );
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        match self.probe(store.find_stuck(cutoff)).await {
            Ok(stuck) => {
                check.detail("stuck_tasks", stuck.len());
                if !stuck.is_empty() {
                    let severity = if stuck.len() >= STUCK_UNHEALTHY_COUNT {
                        HealthLevel::Unhealthy
                    } else {
                        HealthLevel::Degraded
                    };
                    check.issue(
                        severity,
                        format!(
                            "{} jobs running longer than {}s",
                            stuck.len(),
                            self.config.stuck_threshold.as_secs()
                        ),
                    );
                    check.recommend(
                        "Fail overdue running jobs so they can be retried or inspected",
                        Some(RecoveryAction::ClearStuckTasks),
                    );
                }
            }
            Err(e) => check.issue(HealthLevel::Degraded, format!("stuck-task query failed: {}", e)),
        }
        check
    }

    async fn check_queue(&self) -> Check {
        let mut check = Check::new(COMPONENT_QUEUE);
        let fallback = self.flags.fallback_mode();
        check.detail("fallback_mode", fallback);

        match self.probe(self.queue.depths()).await {
            Ok(depths) => {
                let total: usize = depths.values().sum();
                check.detail("depth", total);
                check.detail("depth_by_queue", json!(depths));
                if total >= self.config.backlog_critical {
                    check.issue(HealthLevel::Unhealthy, format!("queue backlog of {} jobs", total));
                    check.recommend("Add workers to drain the backlog (scale_workers:N)", None);
                } else if total >= self.config.backlog_warning {
                    check.issue(HealthLevel::Degraded, format!("queue backlog of {} jobs", total));
                }
                if fallback {
                    check.issue(
                        HealthLevel::Degraded,
                        "fallback mode is active while the queue backend is reachable",
                    );
                    check.recommend(
                        "Move queued jobs back onto the queue backend",
                        Some(RecoveryAction::MigrateBackToQueue),
                    );
                }
            }
            Err(e) => {
                check.issue(HealthLevel::Unhealthy, format!("queue depth unavailable: {}", e));
                return check;
            }
        }

        if let Ok(delayed) = self.probe(self.queue.delayed_len()).await {
            check.detail("delayed_retries", delayed);
        }

        match self.probe(self.dlq.stats()).await {
            Ok(stats) => {
                check.detail("dead_letters", stats.current_size);
                check.detail("dead_letter_capacity", stats.max_size);
                match stats.health {
                    DlqHealth::Healthy => {}
                    DlqHealth::Warning => {
                        check.issue(
                            HealthLevel::Degraded,
                            format!(
                                "dead letter store at {}/{}",
                                stats.current_size, stats.max_size
                            ),
                        );
                        check.recommend("Analyze dead letter patterns before they are evicted", None);
                    }
                    DlqHealth::Critical => {
                        check.issue(
                            HealthLevel::Unhealthy,
                            format!(
                                "dead letter store nearly full ({}/{}), oldest entries are being evicted",
                                stats.current_size, stats.max_size
                            ),
                        );
                        check.recommend(
                            "Inspect, then clear the dead letter store",
                            Some(RecoveryAction::ClearDeadLetterQueue),
                        );
                    }
                }
            }
            Err(e) => debug!("Dead letter stats unavailable: {}", e),
        }
        check
    }

    async fn check_workers(&self) -> Check {
        let mut check = Check::new(COMPONENT_WORKERS);
        let halted = self.flags.processing_halted();
        check.detail("processing_halted", halted);
        if halted {
            check.issue(HealthLevel::Unhealthy, "processing is halted");
            check.recommend("Resume processing once the cause of the shutdown is fixed", None);
        }

        match self.probe(self.control.heartbeats()).await {
            Ok(heartbeats) => {
                let stale_before = Utc::now()
                    - chrono::Duration::from_std(self.control.heartbeat_ttl())
                        .unwrap_or_else(|_| chrono::Duration::minutes(1));
                let live = heartbeats
                    .iter()
                    .filter(|h| h.last_seen >= stale_before)
                    .count();
                check.detail("live_workers", live);
                check.detail(
                    "workers",
                    json!(heartbeats.iter().map(|h| &h.name).collect::<Vec<_>>()),
                );
                if live == 0 && !halted {
                    check.issue(HealthLevel::Degraded, "no live worker heartbeats");
                    check.recommend(
                        "Restart the worker pool",
                        Some(RecoveryAction::RestartWorkers),
                    );
                }
            }
            // Liveness is best-effort; the backend check already reports the outage
            Err(e) => debug!("Worker heartbeats unavailable: {}", e),
        }
        check
    }

    async fn check_performance(&self) -> Check {
        let mut check = Check::new(COMPONENT_PERFORMANCE);
        let store = self.sessions.store();
        let since = Utc::now() - chrono::Duration::hours(1);

        let completed = self
            .probe(store.count_by_status_since(JobStatus::Completed, since))
            .await;
        let failed = self
            .probe(store.count_by_status_since(JobStatus::Failed, since))
            .await;
        let (completed, failed) = match (completed, failed) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Performance counters unavailable: {}", e);
                check.detail("available", false);
                return check;
            }
        };

        check.detail("last_hour", json!({"completed": completed, "failed": failed}));

        let finished = completed + failed;
        if finished > 0 {
            let failure_rate = failed as f64 / finished as f64 * 100.0;
            check.detail("failure_rate_percent", (failure_rate * 100.0).round() / 100.0);
            if failure_rate >= FAILURE_RATE_UNHEALTHY {
                check.issue(
                    HealthLevel::Unhealthy,
                    format!("{:.1}% of jobs failed in the last hour", failure_rate),
                );
                check.recommend("Review dead letter patterns for a common cause", None);
            } else if failure_rate >= FAILURE_RATE_DEGRADED {
                check.issue(
                    HealthLevel::Degraded,
                    format!("{:.1}% of jobs failed in the last hour", failure_rate),
                );
            }
        }

        if let Ok(times) = self.probe(store.processing_times_since(since)).await {
            if !times.is_empty() {
                let avg = times.iter().sum::<f64>() / times.len() as f64;
                check.detail("avg_processing_seconds", (avg * 100.0).round() / 100.0);
            }
        }
        check
    }
}
