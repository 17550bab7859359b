//! Service wiring
//!
//! One `Services` value owns every shared handle built from a
//! `JobGuardConfig`. The CLI, the worker pool and the tests all construct
//! their components through it so they observe the same backend, store and
//! runtime flags.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::JobGuardConfig;
use crate::dlq::DeadLetterStore;
use crate::error::Result;
use crate::monitor::{MetricsCollector, Monitor};
use crate::orchestrator::Orchestrator;
use crate::recovery::{AuditLog, BackupStore, RecoveryEngine};
use crate::retry::{FailureHandler, RetryPolicy};
use crate::storage::{
    JobStore, MemoryBackend, MemoryJobStore, QueueBackend, SessionManager, StorageFactory,
};
use crate::validation::{IntegrityValidator, ValidationCache};
use crate::worker::{JobHandler, JobPipeline, JobQueue, RuntimeFlags, WorkerControl, WorkerPool};

#[derive(Clone)]
pub struct Services {
    pub config: JobGuardConfig,
    pub backend: Arc<dyn QueueBackend>,
    pub store: Arc<dyn JobStore>,
    pub sessions: SessionManager,
    pub queue: JobQueue,
    pub dlq: Arc<DeadLetterStore>,
    pub validator: Arc<IntegrityValidator>,
    pub recovery: Arc<RecoveryEngine>,
    pub failures: Arc<FailureHandler>,
    pub control: WorkerControl,
    pub flags: RuntimeFlags,
}

impl Services {
    /// Build every service on top of an existing backend and store
    pub fn from_parts(
        config: JobGuardConfig,
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let sessions = SessionManager::new(store.clone(), config.sessions.idle_timeout);
        let queue = JobQueue::new(backend.clone());
        let dlq = Arc::new(DeadLetterStore::new(backend.clone(), config.dlq.clone()));
        let validator = Arc::new(IntegrityValidator::new(
            config.validation.clone(),
            ValidationCache::new(backend.clone(), config.validation.cache_ttl),
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            BackupStore::new(backend.clone(), config.recovery.backup_ttl),
            validator.clone(),
            AuditLog::new(backend.clone(), config.recovery.audit_log_max),
        ));
        let failures = Arc::new(FailureHandler::new(
            RetryPolicy::new(config.retry.clone()),
            queue.clone(),
            dlq.clone(),
        ));
        let control = WorkerControl::new(backend.clone(), config.workers.heartbeat_ttl);

        Self {
            config,
            backend,
            store,
            sessions,
            queue,
            dlq,
            validator,
            recovery,
            failures,
            control,
            flags: RuntimeFlags::new(),
        }
    }

    /// In-process backend and store, ignoring `config.storage`
    pub fn in_memory(config: JobGuardConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.storage.memory.clone()));
        let store = Arc::new(MemoryJobStore::new());
        Self::from_parts(config, backend, store)
    }

    /// Connect the configured backend and store
    pub async fn connect(config: JobGuardConfig) -> Result<Self> {
        config.validate()?;
        let backend = StorageFactory::queue_backend(&config.storage).await?;
        let store = StorageFactory::job_store(&config.storage).await?;
        info!(
            "Connected queue backend ({:?}) and job store ({:?})",
            config.storage.backend, config.storage.store
        );
        Ok(Self::from_parts(config, backend, store))
    }

    pub fn pipeline(&self) -> JobPipeline {
        JobPipeline::new(
            self.sessions.clone(),
            self.queue.clone(),
            self.validator.clone(),
            self.recovery.backups().clone(),
            self.failures.clone(),
            self.flags.clone(),
        )
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.orchestrator.clone(),
            self.backend.clone(),
            self.sessions.clone(),
            self.queue.clone(),
            self.dlq.clone(),
            self.recovery.clone(),
            self.control.clone(),
            self.flags.clone(),
        )
    }

    /// Monitor with an orchestrator attached for automated recovery
    pub fn monitor(&self) -> Monitor {
        let collector = MetricsCollector::new(
            self.backend.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.config.orchestrator.stuck_threshold,
        );
        debug!(
            "Monitor auto recovery {}",
            if self.config.monitor.auto_recovery { "enabled" } else { "disabled" }
        );
        Monitor::new(self.config.monitor.clone(), self.backend.clone(), collector)
            .with_orchestrator(Arc::new(self.orchestrator()))
    }

    pub fn worker_pool(&self, handler: Arc<dyn JobHandler>) -> WorkerPool {
        WorkerPool::new(
            self.config.workers.clone(),
            self.pipeline(),
            self.control.clone(),
            handler,
        )
    }
}
