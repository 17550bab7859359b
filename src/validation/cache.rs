//! Short-lived result cache and per-stage counters
//!
//! Results are keyed by job ID and stage so a later pass can pick up what an
//! earlier one derived (the enqueue-time hash in particular). Cache and
//! counter writes are best-effort.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{ValidationResult, ValidationStage};
use crate::storage::{get_json, set_json, QueueBackend, StorageResult};

const RESULT_PREFIX: &str = "validation:result:";
const STATS_PREFIX: &str = "validation:stats:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub valid: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub stages: BTreeMap<ValidationStage, StageStats>,
}

impl ValidationStats {
    pub fn total(&self) -> u64 {
        self.stages.values().map(|s| s.valid + s.invalid).sum()
    }

    /// Percentage of passes that were valid; `None` before any pass
    pub fn pass_rate(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let valid: u64 = self.stages.values().map(|s| s.valid).sum();
        Some(valid as f64 / total as f64 * 100.0)
    }
}

#[derive(Clone)]
pub struct ValidationCache {
    backend: Arc<dyn QueueBackend>,
    ttl: Duration,
}

impl ValidationCache {
    pub fn new(backend: Arc<dyn QueueBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn result_key(job_id: &str, stage: ValidationStage) -> String {
        format!("{}{}:{}", RESULT_PREFIX, job_id, stage.as_str())
    }

    fn stats_key(stage: ValidationStage, valid: bool) -> String {
        format!(
            "{}{}:{}",
            STATS_PREFIX,
            stage.as_str(),
            if valid { "valid" } else { "invalid" }
        )
    }

    /// Cache the result and bump its stage counter
    pub async fn record(&self, result: &ValidationResult) {
        let key = Self::result_key(&result.job_id, result.stage);
        if let Err(e) = set_json(self.backend.as_ref(), &key, result, Some(self.ttl)).await {
            warn!("Failed to cache validation result for {}: {}", result.job_id, e);
        }
        let counter = Self::stats_key(result.stage, result.is_valid);
        if let Err(e) = self.backend.incr_by(&counter, 1).await {
            warn!("Failed to update validation stats: {}", e);
        }
    }

    pub async fn get(
        &self,
        job_id: &str,
        stage: ValidationStage,
    ) -> StorageResult<Option<ValidationResult>> {
        get_json(self.backend.as_ref(), &Self::result_key(job_id, stage)).await
    }

    /// Hash derived by the last cached enqueue pass, if still cached
    pub async fn enqueue_hash(&self, job_id: &str) -> Option<String> {
        match self.get(job_id, ValidationStage::Enqueue).await {
            Ok(result) => result.and_then(|r| r.integrity_hash),
            Err(e) => {
                warn!("Validation cache lookup failed for {}: {}", job_id, e);
                None
            }
        }
    }

    /// Replace the cached enqueue hash after a sanctioned rewrite of the job
    pub async fn set_baseline(&self, job_id: &str, hash: &str) {
        let mut result = ValidationResult::new(job_id, ValidationStage::Enqueue);
        result.integrity_hash = Some(hash.to_string());
        let key = Self::result_key(job_id, ValidationStage::Enqueue);
        if let Err(e) = set_json(self.backend.as_ref(), &key, &result, Some(self.ttl)).await {
            warn!("Failed to rebase integrity hash for {}: {}", job_id, e);
        }
    }

    pub async fn stats(&self) -> StorageResult<ValidationStats> {
        let mut stats = ValidationStats::default();
        for stage in ValidationStage::ALL {
            let valid = self.counter(&Self::stats_key(stage, true)).await?;
            let invalid = self.counter(&Self::stats_key(stage, false)).await?;
            stats.stages.insert(stage, StageStats { valid, invalid });
        }
        Ok(stats)
    }

    async fn counter(&self, key: &str) -> StorageResult<u64> {
        Ok(self
            .backend
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}
