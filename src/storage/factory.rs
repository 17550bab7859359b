//! Storage factory for creating backend and store instances

use std::sync::Arc;

use super::backends::{MemoryBackend, MemoryJobStore};
#[cfg(feature = "postgres")]
use super::backends::PostgresJobStore;
#[cfg(feature = "redis")]
use super::backends::RedisBackend;
use super::config::{BackendType, StorageConfig, StoreType};
use super::error::{StorageError, StorageResult};
use super::traits::{JobStore, QueueBackend};

/// Factory for creating storage instances
pub struct StorageFactory;

impl StorageFactory {
    /// Create the queue backend selected by `config.backend`
    pub async fn queue_backend(config: &StorageConfig) -> StorageResult<Arc<dyn QueueBackend>> {
        match config.backend {
            BackendType::Memory => Ok(Arc::new(MemoryBackend::new(config.memory.clone()))),
            #[cfg(feature = "redis")]
            BackendType::Redis => {
                let redis = config.redis.as_ref().ok_or_else(|| {
                    StorageError::configuration("Redis backend selected without a url")
                })?;
                let backend =
                    RedisBackend::new(redis, &config.key_prefix, config.pool_size, config.timeout)
                        .await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "redis"))]
            BackendType::Redis => Err(StorageError::configuration(
                "Redis backend not enabled. Enable with --features redis",
            )),
        }
    }

    /// Create the job store selected by `config.store`
    pub async fn job_store(config: &StorageConfig) -> StorageResult<Arc<dyn JobStore>> {
        match config.store {
            StoreType::Memory => Ok(Arc::new(MemoryJobStore::new())),
            #[cfg(feature = "postgres")]
            StoreType::Postgres => {
                let pg = config.postgres.as_ref().ok_or_else(|| {
                    StorageError::configuration("PostgreSQL store selected without a connection string")
                })?;
                Ok(Arc::new(PostgresJobStore::new(pg, config.timeout).await?))
            }
            #[cfg(not(feature = "postgres"))]
            StoreType::Postgres => Err(StorageError::configuration(
                "PostgreSQL store not enabled. Enable with --features postgres",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_creates_memory_pair() {
        let config = StorageConfig::default();
        let backend = StorageFactory::queue_backend(&config).await.unwrap();
        let store = StorageFactory::job_store(&config).await.unwrap();
        assert_eq!(backend.info().await.unwrap().backend_type, "memory");
        assert!(store.ping().await.is_ok());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_requires_feature() {
        let config = StorageConfig::default().with_redis_url("redis://localhost");
        let err = StorageFactory::queue_backend(&config).await.err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
    }
}
