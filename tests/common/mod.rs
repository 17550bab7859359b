//! Shared fixtures for integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use jobguard::app::Services;
use jobguard::retry::{Fault, FaultKind};
use jobguard::storage::{MemoryBackend, MemoryJobStore};
use jobguard::{JobGuardConfig, JobRecord};

pub const OWNER: i64 = 5;
pub const CONNECTION: i64 = 9;

/// Services over in-memory storage plus handles to flip availability
pub struct TestEnv {
    pub services: Services,
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<MemoryJobStore>,
}

pub fn test_config() -> JobGuardConfig {
    let mut config = JobGuardConfig::default();
    config.retry.base_delay = Duration::from_secs(1);
    config.retry.max_retries = 3;
    config.retry.jitter = false;
    config
}

pub async fn env_with(config: JobGuardConfig) -> TestEnv {
    let backend = Arc::new(MemoryBackend::new(config.storage.memory.clone()));
    let store = Arc::new(MemoryJobStore::new());
    store.add_connection(CONNECTION, OWNER).await;
    let services = Services::from_parts(config, backend.clone(), store.clone());
    TestEnv {
        services,
        backend,
        store,
    }
}

pub async fn env() -> TestEnv {
    env_with(test_config()).await
}

pub fn job(id: &str) -> JobRecord {
    JobRecord::new(id, OWNER, CONNECTION)
}

pub fn queues() -> Vec<String> {
    vec!["default".to_string()]
}

pub fn succeed(_job: &JobRecord) -> Result<Value, Fault> {
    Ok(json!({"caption": "two dogs on a beach"}))
}

pub fn drop_connection(_job: &JobRecord) -> Result<Value, Fault> {
    Err(Fault::new(
        FaultKind::ConnectionError,
        "connection to 10.0.0.12:6379 reset by peer",
    ))
}
