//! Threshold evaluation, the active alert set and notification throttling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::metrics::{MetricReading, QUEUE_DEPTH_METRIC};
use crate::config::{MetricThresholds, Threshold};
use crate::orchestrator::diagnosis::COMPONENT_QUEUE;
use crate::orchestrator::RecoveryAction;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub component: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub message: String,
    /// Last time the metric was seen over the threshold
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    /// When this alert first fired at its current severity
    #[serde(default = "Utc::now")]
    pub raised_at: DateTime<Utc>,
    /// Recovery action an operator may approve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<RecoveryAction>,
}

/// Action the monitor associates with a metric
pub fn action_for_metric(metric: &str) -> Option<RecoveryAction> {
    match metric {
        "stuck_tasks" => Some(RecoveryAction::ClearStuckTasks),
        "backend_memory" => Some(RecoveryAction::CleanupResources),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventKind {
    Raised,
    /// Severity of an active alert changed
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
    /// Over the throttle budget; tracked but not dispatched
    pub throttled: bool,
}

/// Sliding-window counter per (alert type, severity)
pub struct AlertThrottle {
    max_per_window: usize,
    window: Duration,
    fired: HashMap<(String, AlertSeverity), VecDeque<Instant>>,
}

impl AlertThrottle {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            fired: HashMap::new(),
        }
    }

    /// Record a firing at `now` if the window has room
    pub fn allow(&mut self, alert_type: &str, severity: AlertSeverity, now: Instant) -> bool {
        let stamps = self
            .fired
            .entry((alert_type.to_string(), severity))
            .or_default();
        while stamps
            .front()
            .is_some_and(|first| now.saturating_duration_since(*first) >= self.window)
        {
            stamps.pop_front();
        }
        if stamps.len() >= self.max_per_window {
            return false;
        }
        stamps.push_back(now);
        true
    }
}

fn severity_for(value: f64, threshold: Threshold) -> Option<(AlertSeverity, f64)> {
    if value >= threshold.critical {
        Some((AlertSeverity::Critical, threshold.critical))
    } else if value >= threshold.warning {
        Some((AlertSeverity::Medium, threshold.warning))
    } else {
        None
    }
}

fn describe(reading: &MetricReading, severity: AlertSeverity, threshold: f64) -> String {
    let subject = reading
        .subject
        .as_deref()
        .map(|s| format!(" ({})", s))
        .unwrap_or_default();
    format!(
        "{}{} is {:.2}, over the {} threshold of {:.2}",
        reading.metric, subject, reading.value, severity, threshold
    )
}

struct AlertState {
    active: BTreeMap<String, Alert>,
    throttle: AlertThrottle,
}

/// Owns the active alert set
pub struct AlertManager {
    thresholds: MetricThresholds,
    state: Mutex<AlertState>,
}

impl AlertManager {
    pub fn new(thresholds: MetricThresholds, throttle_max: usize, throttle_window: Duration) -> Self {
        Self {
            thresholds,
            state: Mutex::new(AlertState {
                active: BTreeMap::new(),
                throttle: AlertThrottle::new(throttle_max, throttle_window),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn threshold(&self, metric: &str) -> Option<Threshold> {
        self.thresholds
            .all()
            .into_iter()
            .find(|(name, _)| *name == metric)
            .map(|(_, threshold)| threshold)
    }

    /// Compare readings against the threshold table and update the active set.
    ///
    /// Alerts whose metric was not sampled this cycle are left alone; a
    /// reading back under its warning level resolves the alert.
    pub fn evaluate(&self, readings: &[MetricReading], now: DateTime<Utc>) -> Vec<AlertEvent> {
        let clock = Instant::now();
        let mut state = self.state();
        let mut events = Vec::new();

        for reading in readings {
            let Some(threshold) = self.threshold(reading.metric) else {
                continue;
            };
            let id = reading.alert_id();

            let Some((severity, limit)) = severity_for(reading.value, threshold) else {
                if let Some(resolved) = state.active.remove(&id) {
                    info!("Alert {} resolved ({} = {:.2})", id, reading.metric, reading.value);
                    events.push(AlertEvent {
                        kind: AlertEventKind::Resolved,
                        alert: Alert {
                            metric_value: reading.value,
                            timestamp: now,
                            ..resolved
                        },
                        throttled: false,
                    });
                }
                continue;
            };

            let message = describe(reading, severity, limit);
            if let Some(existing) = state.active.get_mut(&id) {
                if existing.severity == severity {
                    existing.metric_value = reading.value;
                    existing.message = message;
                    existing.timestamp = now;
                    continue;
                }
            }

            let kind = if state.active.contains_key(&id) {
                AlertEventKind::Escalated
            } else {
                AlertEventKind::Raised
            };
            let alert = Alert {
                id: id.clone(),
                severity,
                component: reading.component.to_string(),
                metric_name: reading.metric.to_string(),
                metric_value: reading.value,
                threshold: limit,
                message,
                timestamp: now,
                acknowledged: false,
                raised_at: now,
                suggested_action: action_for_metric(reading.metric),
            };
            let throttled = !state.throttle.allow(reading.metric, severity, clock);
            if throttled {
                debug!("Alert {} at {} throttled", id, severity);
            }
            state.active.insert(id, alert.clone());
            events.push(AlertEvent {
                kind,
                alert,
                throttled,
            });
        }
        events
    }

    /// Zero readings for queues with an active depth alert that are missing
    /// from `depths`. A drained queue's list is deleted, so it drops out of
    /// the sample instead of reporting 0.
    pub fn drained_queue_readings(
        &self,
        depths: &BTreeMap<String, usize>,
    ) -> Vec<MetricReading> {
        let prefix = format!("{}:{}:", COMPONENT_QUEUE, QUEUE_DEPTH_METRIC);
        self.state()
            .active
            .keys()
            .filter_map(|id| id.strip_prefix(&prefix))
            .filter(|queue| !depths.contains_key(*queue))
            .map(|queue| MetricReading {
                component: COMPONENT_QUEUE,
                metric: QUEUE_DEPTH_METRIC,
                subject: Some(queue.to_string()),
                value: 0.0,
            })
            .collect()
    }

    /// Active alerts, most severe first
    pub fn list_active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state().active.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        match self.state().active.get_mut(id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Drop every active alert
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let count = state.active.len();
        state.active.clear();
        count
    }

    /// Replace the active set, e.g. from a persisted copy
    pub fn restore(&self, alerts: Vec<Alert>) {
        let mut state = self.state();
        state.active = alerts.into_iter().map(|a| (a.id.clone(), a)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::diagnosis::{COMPONENT_QUEUE, COMPONENT_STORE};

    fn reading(metric: &'static str, value: f64) -> MetricReading {
        let component = if metric == "stuck_tasks" {
            COMPONENT_STORE
        } else {
            COMPONENT_QUEUE
        };
        MetricReading {
            component,
            metric,
            subject: None,
            value,
        }
    }

    fn manager(throttle_max: usize) -> AlertManager {
        AlertManager::new(
            MetricThresholds::default(),
            throttle_max,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_two_tier_thresholds() {
        let alerts = manager(10);
        let events = alerts.evaluate(&[reading("queue_depth", 150.0)], Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Raised);
        assert_eq!(events[0].alert.severity, AlertSeverity::Medium);
        assert_eq!(events[0].alert.threshold, 100.0);
        assert_eq!(events[0].alert.id, "queue:queue_depth");

        let events = alerts.evaluate(&[reading("queue_depth", 5000.0)], Utc::now());
        assert_eq!(events[0].kind, AlertEventKind::Escalated);
        assert_eq!(events[0].alert.severity, AlertSeverity::Critical);
        assert_eq!(alerts.list_active().len(), 1);
    }

    #[test]
    fn test_steady_alert_updates_without_event() {
        let alerts = manager(10);
        alerts.evaluate(&[reading("queue_depth", 150.0)], Utc::now());
        assert!(alerts.acknowledge("queue:queue_depth"));

        let events = alerts.evaluate(&[reading("queue_depth", 170.0)], Utc::now());
        assert!(events.is_empty());
        let active = alerts.list_active();
        assert_eq!(active[0].metric_value, 170.0);
        assert!(active[0].acknowledged);
    }

    #[test]
    fn test_recovered_metric_resolves_alert() {
        let alerts = manager(10);
        alerts.evaluate(&[reading("stuck_tasks", 4.0)], Utc::now());
        assert_eq!(
            alerts.list_active()[0].suggested_action,
            Some(RecoveryAction::ClearStuckTasks)
        );

        let events = alerts.evaluate(&[reading("stuck_tasks", 0.0)], Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Resolved);
        assert!(alerts.list_active().is_empty());

        // Nothing active, nothing to resolve
        assert!(alerts
            .evaluate(&[reading("stuck_tasks", 0.0)], Utc::now())
            .is_empty());
    }

    #[test]
    fn test_drained_queue_resolves_its_depth_alert() {
        let alerts = manager(10);
        let backlog = MetricReading {
            subject: Some("captions".to_string()),
            ..reading("queue_depth", 150.0)
        };
        alerts.evaluate(&[backlog], Utc::now());
        assert_eq!(alerts.list_active()[0].id, "queue:queue_depth:captions");

        // Other queues still sampled, the drained one is gone
        let depths = BTreeMap::from([("default".to_string(), 3)]);
        let zeros = alerts.drained_queue_readings(&depths);
        assert_eq!(zeros.len(), 1);
        assert_eq!(zeros[0].alert_id(), "queue:queue_depth:captions");
        assert_eq!(zeros[0].value, 0.0);

        let events = alerts.evaluate(&zeros, Utc::now());
        assert_eq!(events[0].kind, AlertEventKind::Resolved);
        assert!(alerts.list_active().is_empty());
        assert!(alerts.drained_queue_readings(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_flapping_metric_is_throttled() {
        let alerts = manager(2);
        let mut dispatched = 0;
        for _ in 0..5 {
            for event in alerts.evaluate(&[reading("queue_depth", 150.0)], Utc::now()) {
                if event.kind == AlertEventKind::Raised && !event.throttled {
                    dispatched += 1;
                }
            }
            alerts.evaluate(&[reading("queue_depth", 1.0)], Utc::now());
        }
        assert_eq!(dispatched, 2);
    }

    #[test]
    fn test_throttle_window_slides() {
        let mut throttle = AlertThrottle::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(throttle.allow("queue_depth", AlertSeverity::Medium, start));
        assert!(!throttle.allow("queue_depth", AlertSeverity::Medium, start + Duration::from_secs(30)));
        // Other severities have their own budget
        assert!(throttle.allow("queue_depth", AlertSeverity::Critical, start));
        assert!(throttle.allow("queue_depth", AlertSeverity::Medium, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_clear_and_unknown_ack() {
        let alerts = manager(10);
        alerts.evaluate(
            &[reading("queue_depth", 150.0), reading("stuck_tasks", 20.0)],
            Utc::now(),
        );
        assert_eq!(alerts.list_active()[0].severity, AlertSeverity::Critical);
        assert!(!alerts.acknowledge("nope"));
        assert_eq!(alerts.clear(), 2);
        assert!(alerts.list_active().is_empty());
    }

    #[test]
    fn test_alert_json_shape() {
        let alerts = manager(10);
        alerts.evaluate(&[reading("queue_depth", 150.0)], Utc::now());
        let value = serde_json::to_value(&alerts.list_active()[0]).unwrap();
        for field in [
            "id",
            "severity",
            "component",
            "metric_name",
            "metric_value",
            "threshold",
            "message",
            "timestamp",
            "acknowledged",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["severity"], "medium");
    }
}
