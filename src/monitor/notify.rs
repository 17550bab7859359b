//! Notification channels and the severity escalation table

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::alert::{AlertEvent, AlertEventKind, AlertSeverity};
use crate::storage::QueueBackend;

pub const NOTIFICATION_LOG_KEY: &str = "alerts:notifications";
const NOTIFICATION_LOG_MAX: usize = 500;
const DASHBOARD_HISTORY_MAX: usize = 200;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a channel sits in the escalation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Dashboard,
    Log,
    Store,
    External,
}

/// Channels notified for each severity
pub fn escalation(severity: AlertSeverity) -> &'static [ChannelKind] {
    match severity {
        AlertSeverity::Low => &[ChannelKind::Dashboard],
        AlertSeverity::Medium => &[ChannelKind::Dashboard, ChannelKind::Log],
        AlertSeverity::High => &[ChannelKind::Dashboard, ChannelKind::Log, ChannelKind::Store],
        AlertSeverity::Critical => &[
            ChannelKind::Dashboard,
            ChannelKind::Log,
            ChannelKind::Store,
            ChannelKind::External,
        ],
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ChannelKind;
    async fn send(&self, event: &AlertEvent) -> Result<()>;
}

/// One delivered notification as the dashboard keeps it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub sent_at: DateTime<Utc>,
    pub event: AlertEvent,
}

pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let alert = &event.alert;
        if event.kind == AlertEventKind::Resolved {
            info!("Alert resolved: {} - {}", alert.id, alert.message);
            return Ok(());
        }
        match alert.severity {
            AlertSeverity::Low => info!("Alert: {} - {}", alert.id, alert.message),
            AlertSeverity::Medium | AlertSeverity::High => {
                warn!("Alert: {} - {}", alert.id, alert.message)
            }
            AlertSeverity::Critical => error!("Alert: {} - {}", alert.id, alert.message),
        }
        Ok(())
    }
}

/// Bounded in-memory history for an operator view
#[derive(Clone, Default)]
pub struct DashboardChannel {
    history: Arc<Mutex<VecDeque<Notification>>>,
}

impl DashboardChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first
    pub fn history(&self, limit: usize) -> Vec<Notification> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }
}

#[async_trait]
impl NotificationChannel for DashboardChannel {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Dashboard
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(Notification {
            sent_at: Utc::now(),
            event: event.clone(),
        });
        while history.len() > DASHBOARD_HISTORY_MAX {
            history.pop_front();
        }
        Ok(())
    }
}

/// Appends notifications to a bounded list on the queue backend
pub struct StoreChannel {
    backend: Arc<dyn QueueBackend>,
}

impl StoreChannel {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NotificationChannel for StoreChannel {
    fn name(&self) -> &str {
        "store"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Store
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let raw = serde_json::to_string(&Notification {
            sent_at: Utc::now(),
            event: event.clone(),
        })?;
        self.backend
            .push_trimmed(NOTIFICATION_LOG_KEY, &raw, NOTIFICATION_LOG_MAX)
            .await
            .context("Failed to append notification")?;
        Ok(())
    }
}

/// POSTs the event as JSON to an external endpoint
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to create webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::External
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?
            .error_for_status()
            .context("Webhook rejected the notification")?;
        Ok(())
    }
}

/// Fans events out to the channels their severity escalates to
#[derive(Default)]
pub struct Notifier {
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, channel: Box<dyn NotificationChannel>) {
        self.channels.push(channel);
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Sends to every escalated channel concurrently and returns how many
    /// accepted the event. A failing channel is logged and skipped.
    pub async fn dispatch(&self, event: &AlertEvent) -> usize {
        let targets = escalation(event.alert.severity);
        let sends = self
            .channels
            .iter()
            .filter(|c| targets.contains(&c.kind()))
            .map(|channel| async move { (channel.name(), channel.send(event).await) });

        let mut delivered = 0;
        for (name, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    debug!("Alert {} sent via {}", event.alert.id, name);
                    delivered += 1;
                }
                Err(e) => error!("Failed to send alert {} via {}: {:#}", event.alert.id, name, e),
            }
        }
        delivered
    }
}
