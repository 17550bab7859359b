//! Storage abstraction layer
//!
//! Two external collaborators sit behind this module: the queue backend, an
//! opaque durable list/KV store holding queues, dead letters, backups and
//! caches, and the job store, the transactional home of job records.

pub mod backends;
pub mod config;
pub mod error;
pub mod factory;
pub mod session;
pub mod traits;
pub mod types;

#[cfg(test)]
mod tests;

pub use backends::{MemoryBackend, MemoryJobStore};
pub use config::{BackendType, StorageConfig, StoreType};
pub use error::{StorageError, StorageResult};
pub use factory::StorageFactory;
pub use session::{JobSession, SessionInfo, SessionManager};
pub use traits::{JobStore, QueueBackend};
pub use types::{BackendInfo, BatchOp, BatchReply};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read and decode a JSON value stored under `key`
pub async fn get_json<T: DeserializeOwned>(
    backend: &dyn QueueBackend,
    key: &str,
) -> StorageResult<Option<T>> {
    match backend.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`
pub async fn set_json<T: Serialize + ?Sized>(
    backend: &dyn QueueBackend,
    key: &str,
    value: &T,
    ttl: Option<std::time::Duration>,
) -> StorageResult<()> {
    let raw = serde_json::to_string(value)?;
    backend.set(key, &raw, ttl).await
}

/// Inclusive `range` bounds for `limit` items starting at `offset`
///
/// `None` when nothing can be returned; large values clamp to `isize::MAX`.
pub fn page_bounds(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 || offset > isize::MAX as usize {
        return None;
    }
    let stop = offset.saturating_add(limit - 1).min(isize::MAX as usize);
    Some((offset as isize, stop as isize))
}
