//! Read-only aggregation over a sample of dead letter entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::DeadLetterEntry;
use crate::retry::FaultCategory;

/// Share of the sample above which one category gets a dedicated recommendation
const DOMINANT_CATEGORY_SHARE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCount {
    pub key: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub min: u32,
    pub max: u32,
    pub avg: f64,
}

/// A group of failures sharing an error signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureGroup {
    pub signature: String,
    pub count: usize,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub sample_job_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub sample_size: usize,
    pub time_range: Option<TimeRange>,
    /// By error category, most frequent first
    pub error_patterns: Vec<PatternCount>,
    /// By queue name, most frequent first
    pub queue_patterns: Vec<PatternCount>,
    pub retry_stats: Option<RetryStats>,
    pub signature_groups: Vec<SignatureGroup>,
    pub recommendations: Vec<String>,
}

pub(crate) fn analyze(sample: &[DeadLetterEntry]) -> PatternAnalysis {
    let total = sample.len();

    let time_range = sample
        .iter()
        .map(|e| e.failed_at)
        .min()
        .zip(sample.iter().map(|e| e.failed_at).max())
        .map(|(oldest, newest)| TimeRange { oldest, newest });

    let error_patterns = count_by(sample, |e| e.error_category.to_string());
    let queue_patterns = count_by(sample, |e| e.queue_name.clone());

    let retry_stats = if total == 0 {
        None
    } else {
        let counts: Vec<u32> = sample.iter().map(|e| e.retry_count).collect();
        Some(RetryStats {
            min: counts.iter().copied().min().unwrap_or(0),
            max: counts.iter().copied().max().unwrap_or(0),
            avg: counts.iter().map(|&c| f64::from(c)).sum::<f64>() / total as f64,
        })
    };

    let recommendations = recommend(total, &error_patterns, &queue_patterns);

    PatternAnalysis {
        sample_size: total,
        time_range,
        error_patterns,
        queue_patterns,
        retry_stats,
        signature_groups: group_signatures(sample),
        recommendations,
    }
}

fn count_by<F>(sample: &[DeadLetterEntry], key: F) -> Vec<PatternCount>
where
    F: Fn(&DeadLetterEntry) -> String,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for entry in sample {
        *counts.entry(key(entry)).or_insert(0) += 1;
    }
    let total = sample.len().max(1) as f64;
    let mut out: Vec<PatternCount> = counts
        .into_iter()
        .map(|(key, count)| PatternCount {
            key,
            count,
            percentage: count as f64 / total * 100.0,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    out
}

fn group_signatures(sample: &[DeadLetterEntry]) -> Vec<SignatureGroup> {
    let mut groups: HashMap<&str, Vec<&DeadLetterEntry>> = HashMap::new();
    for entry in sample {
        groups.entry(&entry.error_signature).or_default().push(entry);
    }
    let mut out: Vec<SignatureGroup> = groups
        .into_iter()
        .filter_map(|(signature, entries)| {
            let first = entries.iter().map(|e| e.failed_at).min()?;
            let last = entries.iter().map(|e| e.failed_at).max()?;
            Some(SignatureGroup {
                signature: signature.to_string(),
                count: entries.len(),
                first_occurrence: first,
                last_occurrence: last,
                sample_job_ids: entries.iter().take(3).map(|e| e.job_id.clone()).collect(),
            })
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
    out
}

fn recommend(
    total: usize,
    error_patterns: &[PatternCount],
    queue_patterns: &[PatternCount],
) -> Vec<String> {
    let mut out = Vec::new();
    if total == 0 {
        return out;
    }

    if let Some(top) = error_patterns.first() {
        if top.count as f64 / total as f64 > DOMINANT_CATEGORY_SHARE {
            let advice = match top.key.parse::<FaultCategory>() {
                Ok(category) => category_remediation(category),
                Err(_) => "Investigate the dominant failure category",
            };
            out.push(format!(
                "{} accounts for {:.0}% of failures: {}",
                top.key, top.percentage, advice
            ));
        }
    }

    if let [only] = queue_patterns {
        out.push(format!(
            "All sampled failures come from queue '{}': investigate that queue's workers and inputs",
            only.key
        ));
    }

    out
}

fn category_remediation(category: FaultCategory) -> &'static str {
    match category {
        FaultCategory::TransientNetwork => {
            "check upstream network connectivity and consider a longer base delay"
        }
        FaultCategory::QueueBackendConnection => {
            "check queue backend health, connection limits and failover"
        }
        FaultCategory::DatabaseConnection => "check database availability and pool sizing",
        FaultCategory::ResourceExhaustion => {
            "reduce worker concurrency or raise memory and rate limits"
        }
        FaultCategory::TaskValidation => "tighten enqueue-time validation of job inputs",
        FaultCategory::ProcessingError => "review recent handler changes and processing logs",
        FaultCategory::SecurityError => "audit credentials and permission grants",
        FaultCategory::SystemError => "inspect host resources and operating system logs",
    }
}
