//! Monitor & alerter
//!
//! Samples metrics on a fixed interval, keeps the active alert set in step
//! with the threshold table and pushes raised, escalated and resolved alerts
//! through the notification channels. Critical alerts that map to a recovery
//! action either run it (when `auto_recovery` is on and an orchestrator is
//! attached) or carry it as a suggestion for an operator.

pub mod alert;
pub mod metrics;
pub mod notify;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use alert::{Alert, AlertEvent, AlertEventKind, AlertManager, AlertSeverity, AlertThrottle};
pub use metrics::{MetricReading, MetricsCollector, MetricsSnapshot};
pub use notify::{
    ChannelKind, DashboardChannel, LogChannel, NotificationChannel, Notifier, StoreChannel,
    WebhookChannel,
};

use crate::config::MonitorConfig;
use crate::orchestrator::{Orchestrator, PlanReport, RecoveryAction};
use crate::storage::{get_json, set_json, QueueBackend, StorageResult};

pub const ACTIVE_ALERTS_KEY: &str = "alerts:active";

/// What one monitoring pass saw and did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub snapshot: MetricsSnapshot,
    pub events: Vec<AlertEvent>,
    pub notifications_sent: usize,
    pub recovery_plans: Vec<PlanReport>,
}

pub struct Monitor {
    config: MonitorConfig,
    backend: Arc<dyn QueueBackend>,
    collector: MetricsCollector,
    alerts: AlertManager,
    notifier: Notifier,
    dashboard: DashboardChannel,
    orchestrator: Option<Arc<Orchestrator>>,
}

impl Monitor {
    /// Builds the default channels: dashboard, log, store, and a webhook
    /// when `webhook_url` is set.
    pub fn new(
        config: MonitorConfig,
        backend: Arc<dyn QueueBackend>,
        collector: MetricsCollector,
    ) -> Self {
        let dashboard = DashboardChannel::new();
        let mut notifier = Notifier::new();
        notifier.add_channel(Box::new(dashboard.clone()));
        notifier.add_channel(Box::new(LogChannel));
        notifier.add_channel(Box::new(StoreChannel::new(backend.clone())));
        if let Some(url) = &config.webhook_url {
            match WebhookChannel::new(url.clone()) {
                Ok(webhook) => notifier.add_channel(Box::new(webhook)),
                Err(e) => warn!("Webhook channel disabled: {:#}", e),
            }
        }

        let alerts = AlertManager::new(
            config.thresholds.clone(),
            config.throttle_max,
            config.throttle_window,
        );
        Self {
            config,
            backend,
            collector,
            alerts,
            notifier,
            dashboard,
            orchestrator: None,
        }
    }

    /// Attach the orchestrator used for automated recovery
    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn add_channel(&mut self, channel: Box<dyn NotificationChannel>) {
        self.notifier.add_channel(channel);
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn dashboard(&self) -> &DashboardChannel {
        &self.dashboard
    }

    /// Load a persisted active set, if there is one
    pub async fn restore_alerts(&self) -> StorageResult<usize> {
        let alerts: Vec<Alert> = get_json(self.backend.as_ref(), ACTIVE_ALERTS_KEY)
            .await?
            .unwrap_or_default();
        let count = alerts.len();
        self.alerts.restore(alerts);
        Ok(count)
    }

    pub async fn acknowledge(&self, id: &str) -> bool {
        let found = self.alerts.acknowledge(id);
        if found {
            self.persist_alerts().await;
        }
        found
    }

    pub async fn clear_alerts(&self) -> usize {
        let cleared = self.alerts.clear();
        self.persist_alerts().await;
        cleared
    }

    /// One sample, evaluate, notify, recover pass
    pub async fn run_cycle(&self) -> CycleReport {
        let snapshot = self.collector.collect().await;
        let mut readings = snapshot.readings();
        if let Some(depths) = &snapshot.queue_depths {
            readings.extend(self.alerts.drained_queue_readings(depths));
        }
        let events = self.alerts.evaluate(&readings, snapshot.timestamp);

        let mut notifications_sent = 0;
        for event in events.iter().filter(|e| !e.throttled) {
            notifications_sent += self.notifier.dispatch(event).await;
        }

        let recovery_plans = self.auto_recover(&events).await;
        self.persist_alerts().await;

        debug!(
            "Monitor cycle: {} alert events, {} notifications, {} recovery plans",
            events.len(),
            notifications_sent,
            recovery_plans.len()
        );
        CycleReport {
            snapshot,
            events,
            notifications_sent,
            recovery_plans,
        }
    }

    /// Run cycles every `interval` until the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Monitor started, sampling every {:?}", self.config.interval);
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn auto_recover(&self, events: &[AlertEvent]) -> Vec<PlanReport> {
        let mut actions: Vec<RecoveryAction> = Vec::new();
        for event in events {
            let alert = &event.alert;
            if event.kind == AlertEventKind::Resolved
                || event.throttled
                || alert.severity != AlertSeverity::Critical
            {
                continue;
            }
            if let Some(action) = alert.suggested_action {
                if !actions.contains(&action) {
                    actions.push(action);
                }
            }
        }
        if actions.is_empty() {
            return Vec::new();
        }

        let orchestrator = match &self.orchestrator {
            Some(orchestrator) if self.config.auto_recovery => orchestrator,
            _ => {
                info!(
                    "Critical alerts suggest {} recovery action(s); awaiting operator approval",
                    actions.len()
                );
                return Vec::new();
            }
        };

        let mut plans = Vec::with_capacity(actions.len());
        for action in actions {
            warn!("Automated recovery: running {}", action);
            plans.push(orchestrator.execute_plan(&[action]).await);
        }
        plans
    }

    async fn persist_alerts(&self) {
        if !self.config.persist_alerts {
            return;
        }
        let active = self.alerts.list_active();
        if let Err(e) = set_json(self.backend.as_ref(), ACTIVE_ALERTS_KEY, &active, None).await {
            warn!("Failed to persist active alerts: {}", e);
        }
    }
}
