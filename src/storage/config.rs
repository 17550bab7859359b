//! Storage configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process backend (default, also used by tests)
    #[default]
    Memory,
    /// Redis, requires the `redis` feature
    Redis,
}

/// Job store kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    /// PostgreSQL, requires the `postgres` feature
    Postgres,
}

/// Main storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendType,

    #[serde(default)]
    pub store: StoreType,

    /// Prefix applied to every queue-backend key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection pool size for networked backends
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Default timeout for connection establishment
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default)]
    pub postgres: Option<PostgresConfig>,

    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,

    #[serde(default)]
    pub database: u32,
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Memory backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Reported memory ceiling (bytes), zero for none
    #[serde(default = "default_memory_limit")]
    pub max_memory: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory: default_memory_limit(),
        }
    }
}

fn default_key_prefix() -> String {
    "jobguard:".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_memory_limit() -> u64 {
    100 * 1024 * 1024 // 100 MB
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            store: StoreType::default(),
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            timeout: default_timeout(),
            redis: None,
            postgres: None,
            memory: MemoryConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Point the queue backend at Redis
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.backend = BackendType::Redis;
        self.redis = Some(RedisConfig {
            url: url.into(),
            database: 0,
        });
        self
    }

    /// Point the job store at PostgreSQL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.store = StoreType::Postgres;
        self.postgres = Some(PostgresConfig {
            connection_string: url.into(),
            schema: default_schema(),
            max_connections: default_max_connections(),
        });
        self
    }

    /// Check that the selected kinds carry their connection settings
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == BackendType::Redis && self.redis.is_none() {
            return Err("storage.backend = \"redis\" requires a [storage.redis] url".to_string());
        }
        if self.store == StoreType::Postgres && self.postgres.is_none() {
            return Err(
                "storage.store = \"postgres\" requires a [storage.postgres] connection_string"
                    .to_string(),
            );
        }
        if self.pool_size == 0 {
            return Err("storage.pool_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_in_process() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, BackendType::Memory);
        assert_eq!(config.store, StoreType::Memory);
        assert_eq!(config.key_prefix, "jobguard:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_without_url_is_rejected() {
        let config = StorageConfig {
            backend: BackendType::Redis,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.with_redis_url("redis://localhost").validate().is_ok());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let config: StorageConfig = toml::from_str(
            r#"
            store = "postgres"
            timeout = "3s"

            [postgres]
            connection_string = "postgres://localhost/jobs"
            "#,
        )
        .unwrap();
        assert_eq!(config.store, StoreType::Postgres);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.postgres.unwrap().schema, "public");
    }
}
