//! In-memory queue backend for testing and single-process deployments

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::storage::{
    config::MemoryConfig,
    error::{StorageError, StorageResult},
    traits::QueueBackend,
    types::{BackendInfo, BatchOp, BatchReply},
};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size_bytes(&self) -> u64 {
        match &self.value {
            Value::Str(s) => s.len() as u64,
            Value::List(items) => items.iter().map(|s| s.len() as u64).sum(),
        }
    }
}

type Keyspace = HashMap<String, Entry>;

/// In-memory queue backend
///
/// TTLs expire lazily on access. `set_available(false)` makes every call fail
/// with `Unavailable`, which is how tests simulate an unreachable backend.
pub struct MemoryBackend {
    config: MemoryConfig,
    data: Arc<RwLock<Keyspace>>,
    available: AtomicBool,
}

impl MemoryBackend {
    /// Create a new memory backend
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            data: Arc::new(RwLock::new(HashMap::new())),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated reachability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable("memory backend marked unreachable"))
        }
    }

    fn live<'a>(data: &'a mut Keyspace, key: &str, now: Instant) -> Option<&'a mut Entry> {
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        data.get_mut(key)
    }

    fn list_mut<'a>(
        data: &'a mut Keyspace,
        key: &str,
        now: Instant,
    ) -> StorageResult<&'a mut VecDeque<String>> {
        if Self::live(data, key, now).is_none() {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match data.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(items)) => Ok(items),
            _ => Err(wrong_type(key)),
        }
    }

    fn apply(data: &mut Keyspace, op: BatchOp, now: Instant) -> StorageResult<BatchReply> {
        match op {
            BatchOp::Push { key, value } => {
                let list = Self::list_mut(data, &key, now)?;
                list.push_back(value);
                Ok(BatchReply::Length(list.len()))
            }
            BatchOp::PushTrimmed {
                key,
                value,
                max_len,
            } => {
                let list = Self::list_mut(data, &key, now)?;
                list.push_front(value);
                list.truncate(max_len);
                Ok(BatchReply::Length(list.len()))
            }
            BatchOp::Set { key, value, ttl } => {
                data.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                Ok(BatchReply::Ok)
            }
            BatchOp::IncrBy { key, delta } => {
                let current = match Self::live(data, &key, now) {
                    Some(Entry {
                        value: Value::Str(s),
                        ..
                    }) => s.parse::<i64>().map_err(|_| {
                        StorageError::serialization(format!("value at {} is not an integer", key))
                    })?,
                    Some(_) => return Err(wrong_type(&key)),
                    None => 0,
                };
                let next = current + delta;
                let expires_at = data.get(&key).and_then(|e| e.expires_at);
                data.insert(
                    key,
                    Entry {
                        value: Value::Str(next.to_string()),
                        expires_at,
                    },
                );
                Ok(BatchReply::Counter(next))
            }
            BatchOp::Expire { key, ttl } => {
                if let Some(entry) = Self::live(data, &key, now) {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(BatchReply::Ok)
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
                Ok(BatchReply::Ok)
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::conflict(format!("WRONGTYPE operation against key {}", key))
}

/// Resolve a Redis-style inclusive range against a list length
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let list = Self::list_mut(&mut data, key, Instant::now())?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn pop(&self, key: &str) -> StorageResult<Option<String>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let now = Instant::now();
        let popped = match Self::live(&mut data, key, now) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items.pop_front(),
            Some(_) => return Err(wrong_type(key)),
            None => None,
        };
        if matches!(data.get(key), Some(Entry { value: Value::List(items), .. }) if items.is_empty())
        {
            data.remove(key);
        }
        Ok(popped)
    }

    async fn push_trimmed(&self, key: &str, value: &str, max_len: usize) -> StorageResult<usize> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let reply = Self::apply(
            &mut data,
            BatchOp::PushTrimmed {
                key: key.to_string(),
                value: value.to_string(),
                max_len,
            },
            Instant::now(),
        )?;
        match reply {
            BatchReply::Length(len) => Ok(len),
            _ => Ok(0),
        }
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StorageResult<Vec<String>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match Self::live(&mut data, key, Instant::now()) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(match resolve_range(items.len(), start, stop) {
                Some((from, to)) => items.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn list_len(&self, key: &str) -> StorageResult<usize> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match Self::live(&mut data, key, Instant::now()) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn remove_value(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match Self::live(&mut data, key, Instant::now()) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                let before = items.len();
                items.retain(|item| item != value);
                Ok(before - items.len())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match Self::live(&mut data, key, Instant::now()) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        Self::apply(
            &mut data,
            BatchOp::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
            Instant::now(),
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let existed = Self::live(&mut data, key, Instant::now()).is_some();
        data.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let now = Instant::now();
        match Self::live(&mut data, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match Self::apply(
            &mut data,
            BatchOp::IncrBy {
                key: key.to_string(),
                delta,
            },
            Instant::now(),
        )? {
            BatchReply::Counter(value) => Ok(value),
            _ => Ok(0),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let now = Instant::now();
        data.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> StorageResult<Vec<BatchReply>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let now = Instant::now();
        // Apply against a scratch copy so a failing op leaves nothing behind
        let mut scratch = data.clone();
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            replies.push(Self::apply(&mut scratch, op, now)?);
        }
        *data = scratch;
        Ok(replies)
    }

    async fn ping(&self) -> StorageResult<Duration> {
        self.check_available()?;
        let start = Instant::now();
        let _guard = self.data.read().await;
        Ok(start.elapsed())
    }

    async fn info(&self) -> StorageResult<BackendInfo> {
        self.check_available()?;
        let data = self.data.read().await;
        let now = Instant::now();
        let used: u64 = data
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| k.len() as u64 + e.size_bytes())
            .sum();
        Ok(BackendInfo {
            backend_type: "memory".to_string(),
            used_memory_bytes: used,
            max_memory_bytes: self.config.max_memory,
            connected_clients: 1,
        })
    }

    async fn reconnect(&self) -> StorageResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_matches_redis_semantics() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 1, 2), Some((1, 2)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 6, 10), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_push_trimmed_keeps_newest() {
        let backend = MemoryBackend::default();
        for i in 0..5 {
            backend.push_trimmed("ring", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(backend.range("ring", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_fifo_push_pop() {
        let backend = MemoryBackend::default();
        backend.push("q", "a").await.unwrap();
        backend.push("q", "b").await.unwrap();
        assert_eq!(backend.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(backend.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(backend.pop("q").await.unwrap(), None);
        assert_eq!(backend.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expires_keys() {
        let backend = MemoryBackend::default();
        backend
            .set("short", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        backend.set("long", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.get("short").await.unwrap(), None);
        assert_eq!(backend.scan_prefix("").await.unwrap(), vec!["long"]);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let backend = MemoryBackend::default();
        backend.push("list", "x").await.unwrap();
        let result = backend
            .execute_batch(vec![
                BatchOp::IncrBy {
                    key: "counter".to_string(),
                    delta: 1,
                },
                BatchOp::IncrBy {
                    key: "list".to_string(),
                    delta: 1,
                },
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.get("counter").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_every_call() {
        let backend = MemoryBackend::default();
        backend.set_available(false);
        assert!(matches!(
            backend.ping().await,
            Err(StorageError::Unavailable(_))
        ));
        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }
}
