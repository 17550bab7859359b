//! Redis queue backend implementation

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::storage::{
    config::RedisConfig,
    error::{StorageError, StorageResult},
    traits::QueueBackend,
    types::{BackendInfo, BatchOp, BatchReply},
};

/// Keys returned per SCAN round trip
const SCAN_COUNT: usize = 200;

/// Redis queue backend
pub struct RedisBackend {
    pool: Pool,
    key_prefix: String,
}

impl RedisBackend {
    /// Create a new Redis backend and verify connectivity
    pub async fn new(
        config: &RedisConfig,
        key_prefix: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> StorageResult<Self> {
        info!("Initializing Redis backend");

        let mut pool_config = Config::from_url(config.url.clone());
        let mut sizing = PoolConfig::new(pool_size);
        sizing.timeouts.wait = Some(timeout);
        sizing.timeouts.create = Some(timeout);
        sizing.timeouts.recycle = Some(timeout);
        pool_config.pool = Some(sizing);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::connection(format!("Failed to create Redis pool: {}", e)))?;

        let backend = Self {
            pool,
            key_prefix: key_prefix.to_string(),
        };

        if config.database > 0 {
            let mut conn = backend.conn().await?;
            let _: () = redis::cmd("SELECT")
                .arg(config.database)
                .query_async(&mut conn)
                .await?;
        }

        backend.ping().await?;
        Ok(backend)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn conn(&self) -> StorageResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::connection(format!("Failed to get Redis connection: {}", e)))
    }

    /// Append the commands for one batch op; returns how many replies it yields
    fn queue_op(&self, pipe: &mut redis::Pipeline, op: &BatchOp) -> usize {
        match op {
            BatchOp::Push { key, value } => {
                pipe.cmd("RPUSH").arg(self.key(key)).arg(value);
                1
            }
            BatchOp::PushTrimmed {
                key,
                value,
                max_len,
            } => {
                let key = self.key(key);
                pipe.cmd("LPUSH").arg(&key).arg(value);
                pipe.cmd("LTRIM")
                    .arg(&key)
                    .arg(0)
                    .arg(max_len.saturating_sub(1) as i64);
                pipe.cmd("LLEN").arg(&key);
                3
            }
            BatchOp::Set { key, value, ttl } => {
                let cmd = pipe.cmd("SET").arg(self.key(key)).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
                }
                1
            }
            BatchOp::IncrBy { key, delta } => {
                pipe.cmd("INCRBY").arg(self.key(key)).arg(*delta);
                1
            }
            BatchOp::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE")
                    .arg(self.key(key))
                    .arg(ttl.as_millis().max(1) as u64);
                1
            }
            BatchOp::Delete { key } => {
                pipe.cmd("DEL").arg(self.key(key));
                1
            }
        }
    }
}

fn as_int(value: &Value) -> StorageResult<i64> {
    redis::from_redis_value::<i64>(value).map_err(StorageError::from)
}

fn to_reply(op: &BatchOp, values: &[Value]) -> StorageResult<BatchReply> {
    match op {
        BatchOp::Push { .. } => Ok(BatchReply::Length(as_int(&values[0])? as usize)),
        BatchOp::PushTrimmed { .. } => Ok(BatchReply::Length(as_int(&values[2])? as usize)),
        BatchOp::IncrBy { .. } => Ok(BatchReply::Counter(as_int(&values[0])?)),
        BatchOp::Set { .. } | BatchOp::Expire { .. } | BatchOp::Delete { .. } => Ok(BatchReply::Ok),
    }
}

/// Pull `field:value` out of an INFO payload
fn info_field(info: &str, field: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (name, value) = line.trim().split_once(':')?;
        if name == field {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, key: &str, value: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        let len: usize = redis::cmd("RPUSH")
            .arg(self.key(key))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn pop(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("LPOP")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn push_trimmed(&self, key: &str, value: &str, max_len: usize) -> StorageResult<usize> {
        let replies = self
            .execute_batch(vec![BatchOp::PushTrimmed {
                key: key.to_string(),
                value: value.to_string(),
                max_len,
            }])
            .await?;
        match replies.first() {
            Some(BatchReply::Length(len)) => Ok(*len),
            _ => Ok(0),
        }
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(key))
            .arg(start as i64)
            .arg(stop as i64)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn list_len(&self, key: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn remove_value(&self, key: &str, value: &str) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        let removed: usize = redis::cmd("LREM")
            .arg(self.key(key))
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        self.execute_batch(vec![BatchOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd("INCRBY")
            .arg(self.key(key))
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", self.key(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> StorageResult<Vec<BatchReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        let widths: Vec<usize> = ops.iter().map(|op| self.queue_op(&mut pipe, op)).collect();

        let mut conn = self.conn().await?;
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        let expected: usize = widths.iter().sum();
        if values.len() != expected {
            return Err(StorageError::database(format!(
                "pipeline returned {} replies, expected {}",
                values.len(),
                expected
            )));
        }

        let mut offset = 0;
        let mut replies = Vec::with_capacity(ops.len());
        for (op, width) in ops.iter().zip(widths) {
            replies.push(to_reply(op, &values[offset..offset + width])?);
            offset += width;
        }
        Ok(replies)
    }

    async fn ping(&self) -> StorageResult<Duration> {
        let start = Instant::now();
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(start.elapsed())
    }

    async fn info(&self) -> StorageResult<BackendInfo> {
        let mut conn = self.conn().await?;
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        Ok(BackendInfo {
            backend_type: "redis".to_string(),
            used_memory_bytes: info_field(&raw, "used_memory").unwrap_or(0),
            max_memory_bytes: info_field(&raw, "maxmemory").unwrap_or(0),
            connected_clients: info_field(&raw, "connected_clients").unwrap_or(0),
        })
    }

    async fn reconnect(&self) -> StorageResult<()> {
        warn!("Dropping pooled Redis connections");
        let _ = self.pool.retain(|_, _| false);
        self.ping().await.map(|_| ())
    }
}
