//! Shared types for the storage layer

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One operation of an atomic batch against the queue backend
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Append to the tail of a list
    Push { key: String, value: String },
    /// Prepend to the head of a list and trim it to `max_len` entries
    PushTrimmed {
        key: String,
        value: String,
        max_len: usize,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    IncrBy { key: String, delta: i64 },
    Expire { key: String, ttl: Duration },
    Delete { key: String },
}

/// Per-operation reply of an executed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReply {
    /// New list length after a push
    Length(usize),
    /// New counter value after an increment
    Counter(i64),
    Ok,
}

/// Health/info snapshot reported by the queue backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend_type: String,
    pub used_memory_bytes: u64,
    /// Zero when the backend has no configured ceiling
    pub max_memory_bytes: u64,
    pub connected_clients: u64,
}

impl BackendInfo {
    /// Memory pressure as a percentage of the ceiling, if one is configured
    pub fn memory_usage_percent(&self) -> Option<f64> {
        if self.max_memory_bytes == 0 {
            None
        } else {
            Some(self.used_memory_bytes as f64 / self.max_memory_bytes as f64 * 100.0)
        }
    }
}
