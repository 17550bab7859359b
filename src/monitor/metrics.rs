//! Periodic metrics sampling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::job::JobStatus;
use crate::orchestrator::diagnosis::{
    COMPONENT_BACKEND, COMPONENT_PERFORMANCE, COMPONENT_QUEUE, COMPONENT_STORE,
};
use crate::storage::{JobStore, QueueBackend, StorageResult};
use crate::worker::JobQueue;

pub const QUEUE_DEPTH_METRIC: &str = "queue_depth";

/// One sampled value a threshold can be applied to
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub component: &'static str,
    pub metric: &'static str,
    /// Distinguishes several readings of one metric, e.g. the queue name
    pub subject: Option<String>,
    pub value: f64,
}

impl MetricReading {
    fn new(component: &'static str, metric: &'static str, value: f64) -> Self {
        Self {
            component,
            metric,
            subject: None,
            value,
        }
    }

    /// Stable alert ID: `component:metric[:subject]`
    pub fn alert_id(&self) -> String {
        match &self.subject {
            Some(subject) => format!("{}:{}:{}", self.component, self.metric, subject),
            None => format!("{}:{}", self.component, self.metric),
        }
    }
}

/// Everything the monitor samples in one cycle. Unavailable samples are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queue_depths: Option<BTreeMap<String, usize>>,
    pub completed_last_hour: Option<u64>,
    pub failed_last_hour: Option<u64>,
    pub completed_last_day: Option<u64>,
    pub failed_last_day: Option<u64>,
    pub avg_processing_seconds: Option<f64>,
    pub p95_processing_seconds: Option<f64>,
    pub backend_memory_percent: Option<f64>,
    pub backend_response_ms: Option<f64>,
    pub stuck_tasks: Option<usize>,
}

impl MetricsSnapshot {
    /// Percent of jobs finished in the last hour that failed
    pub fn failure_rate(&self) -> Option<f64> {
        let completed = self.completed_last_hour?;
        let failed = self.failed_last_hour?;
        let finished = completed + failed;
        (finished > 0).then(|| failed as f64 / finished as f64 * 100.0)
    }

    /// Flatten into threshold-comparable readings
    pub fn readings(&self) -> Vec<MetricReading> {
        let mut out = Vec::new();
        if let Some(depths) = &self.queue_depths {
            for (queue, depth) in depths {
                out.push(MetricReading {
                    subject: Some(queue.clone()),
                    ..MetricReading::new(COMPONENT_QUEUE, QUEUE_DEPTH_METRIC, *depth as f64)
                });
            }
        }
        let scalars = [
            (COMPONENT_PERFORMANCE, "failure_rate", self.failure_rate()),
            (
                COMPONENT_PERFORMANCE,
                "avg_processing_time",
                self.avg_processing_seconds,
            ),
            (
                COMPONENT_PERFORMANCE,
                "p95_processing_time",
                self.p95_processing_seconds,
            ),
            (COMPONENT_BACKEND, "backend_memory", self.backend_memory_percent),
            (
                COMPONENT_BACKEND,
                "backend_response_time",
                self.backend_response_ms,
            ),
            (
                COMPONENT_STORE,
                "stuck_tasks",
                self.stuck_tasks.map(|n| n as f64),
            ),
        ];
        for (component, metric, value) in scalars {
            if let Some(value) = value {
                out.push(MetricReading::new(component, metric, value));
            }
        }
        out
    }
}

/// Nearest-rank percentile of an unsorted sample
pub fn percentile(samples: &[f64], pct: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

pub struct MetricsCollector {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    stuck_threshold: Duration,
}

impl MetricsCollector {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn JobStore>,
        queue: JobQueue,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            queue,
            stuck_threshold,
        }
    }

    pub async fn collect(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let hour_ago = now - chrono::Duration::hours(1);
        let day_ago = now - chrono::Duration::days(1);

        let times = sample(
            "processing times",
            self.store.processing_times_since(hour_ago).await,
        );
        let avg_processing_seconds = times
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().sum::<f64>() / t.len() as f64);
        let p95_processing_seconds = times.as_deref().and_then(|t| percentile(t, 95.0));

        let backend_response_ms = sample("backend ping", self.backend.ping().await)
            .map(|latency| latency.as_secs_f64() * 1000.0);
        let backend_memory_percent = match backend_response_ms {
            Some(_) => sample("backend info", self.backend.info().await)
                .and_then(|info| info.memory_usage_percent()),
            None => None,
        };

        let stuck_cutoff = now
            - chrono::Duration::from_std(self.stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        MetricsSnapshot {
            timestamp: now,
            queue_depths: sample("queue depths", self.queue.depths().await),
            completed_last_hour: self.count(JobStatus::Completed, hour_ago).await,
            failed_last_hour: self.count(JobStatus::Failed, hour_ago).await,
            completed_last_day: self.count(JobStatus::Completed, day_ago).await,
            failed_last_day: self.count(JobStatus::Failed, day_ago).await,
            avg_processing_seconds,
            p95_processing_seconds,
            backend_memory_percent,
            backend_response_ms,
            stuck_tasks: sample("stuck tasks", self.store.find_stuck(stuck_cutoff).await)
                .map(|jobs| jobs.len()),
        }
    }

    async fn count(&self, status: JobStatus, since: DateTime<Utc>) -> Option<u64> {
        sample(
            "status counts",
            self.store.count_by_status_since(status, since).await,
        )
    }
}

fn sample<T>(what: &str, result: StorageResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Metric sample '{}' unavailable: {}", what, e);
            None
        }
    }
}
