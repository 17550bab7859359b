//! Validator -> queue -> handler -> failure path
//!
//! `JobPipeline` owns one processing attempt end to end. The handler only
//! computes; status transitions, validation and the failure path all happen
//! here, each attempt under its own job-store session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::RuntimeFlags;
use crate::context::AttemptContext;
use crate::error::Result;
use crate::job::{JobRecord, JobStatus};
use crate::recovery::BackupStore;
use crate::retry::{FailureHandler, FailureOutcome, Fault, FaultKind};
use crate::storage::{JobSession, SessionManager};
use crate::validation::{IntegrityValidator, IssueCode, ValidationResult};

/// Queued records scanned per poll while in fallback mode
const FALLBACK_SCAN_LIMIT: usize = 1000;

/// Floor on how often a running handler's session is marked in use
const MIN_KEEP_ALIVE: Duration = Duration::from_millis(10);

/// The job body a worker runs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &AttemptContext, job: &JobRecord) -> std::result::Result<Value, Fault>;
}

#[async_trait]
impl<F> JobHandler for F
where
    F: Fn(&JobRecord) -> std::result::Result<Value, Fault> + Send + Sync,
{
    async fn handle(&self, _ctx: &AttemptContext, job: &JobRecord) -> std::result::Result<Value, Fault> {
        self(job)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed {
        job_id: String,
        validation: ValidationResult,
    },
    Failed {
        job_id: String,
        outcome: FailureOutcome,
    },
    Skipped {
        job_id: String,
        reason: String,
    },
}

impl ProcessOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            ProcessOutcome::Completed { job_id, .. }
            | ProcessOutcome::Failed { job_id, .. }
            | ProcessOutcome::Skipped { job_id, .. } => job_id,
        }
    }
}

#[derive(Clone)]
pub struct JobPipeline {
    sessions: SessionManager,
    queue: JobQueue,
    validator: Arc<IntegrityValidator>,
    backups: BackupStore,
    failures: Arc<FailureHandler>,
    flags: RuntimeFlags,
}

impl JobPipeline {
    pub fn new(
        sessions: SessionManager,
        queue: JobQueue,
        validator: Arc<IntegrityValidator>,
        backups: BackupStore,
        failures: Arc<FailureHandler>,
        flags: RuntimeFlags,
    ) -> Self {
        Self {
            sessions,
            queue,
            validator,
            backups,
            failures,
            flags,
        }
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Validate, store and queue a new job
    ///
    /// A job that fails validation is neither stored nor queued; the result
    /// says why. In fallback mode the stored record is the only copy and
    /// workers find it by scanning the store.
    pub async fn enqueue(&self, mut job: JobRecord) -> Result<ValidationResult> {
        let session = self.sessions.acquire("enqueue");
        let result = self.validator.validate_for_enqueue(&session, &mut job).await;
        if !result.is_valid {
            warn!("Rejected job {}: {}", job.id, result.error_summary());
            return Ok(result);
        }

        session.insert(&job).await?;
        if self.flags.fallback_mode() {
            info!("Stored job {} (fallback mode, not queued)", job.id);
        } else if let Err(e) = self.queue.enqueue(&job).await {
            warn!("Job {} stored but could not be queued: {}", job.id, e);
        } else {
            info!("Queued job {} on {} ({})", job.id, job.queue_name, job.priority);
        }
        Ok(result)
    }

    /// Run at most one job from `queues`
    ///
    /// Returns `Ok(None)` when nothing is ready or processing is halted.
    pub async fn process_next(
        &self,
        worker: &str,
        queues: &[String],
        handler: &dyn JobHandler,
    ) -> Result<Option<ProcessOutcome>> {
        if self.flags.processing_halted() {
            return Ok(None);
        }
        let session = self.sessions.acquire(worker);

        let Some(job_id) = self.claim_next(&session, queues).await? else {
            return Ok(None);
        };
        let Some(mut job) = session.get(&job_id).await? else {
            warn!("Queued job {} has no record, dropping it", job_id);
            return Ok(Some(skipped(job_id, "job record not found")));
        };
        if job.status != JobStatus::Queued {
            debug!("Skipping job {}: already {}", job_id, job.status);
            return Ok(Some(skipped(job_id, format!("job is {}", job.status))));
        }

        self.backups.create(&job).await;
        if let Err(e) = job.mark_running(Utc::now()) {
            return Ok(Some(skipped(job_id, e.to_string())));
        }
        if let Err(e) = session.update(&job).await {
            error!("Failed to mark job {} running: {}", job_id, e);
            return Err(e.into());
        }

        let ctx = AttemptContext::new(&job, worker);
        info!("Processing {}", ctx);

        let check = self.validator.validate_during_processing(&job).await;
        if !check.is_valid {
            let kind = if check.has_code(IssueCode::DataIntegrityViolation) {
                FaultKind::DataIntegrity
            } else {
                FaultKind::Validation
            };
            error!("Aborting {}: {}", ctx, check.error_summary());
            let fault = Fault::new(kind, check.error_summary());
            return Ok(Some(self.fail(&session, &ctx, &mut job, &fault).await));
        }

        let result = self.run_handler(&session, handler, &ctx, &job).await;

        // The stuck-task sweep may have failed the job while it ran
        job = match session.get(&job_id).await? {
            Some(current) if current.status.is_terminal() => {
                warn!(
                    "Abandoning result of {}: job was finalized as {} meanwhile",
                    ctx, current.status
                );
                return Ok(Some(skipped(job_id, format!("job became {}", current.status))));
            }
            Some(current) => current,
            None => {
                warn!("Job {} disappeared while processing", job_id);
                return Ok(Some(skipped(job_id, "job record disappeared")));
            }
        };

        match result {
            Ok(output) => self.complete(&session, &ctx, job, &output).await,
            Err(fault) => Ok(Some(self.fail(&session, &ctx, &mut job, &fault).await)),
        }
    }

    /// Run the handler while keeping the attempt's session off the idle
    /// reaper's list; the handler may outlive `idle_timeout`
    async fn run_handler(
        &self,
        session: &JobSession,
        handler: &dyn JobHandler,
        ctx: &AttemptContext,
        job: &JobRecord,
    ) -> std::result::Result<Value, Fault> {
        let period = (self.sessions.idle_timeout() / 2).max(MIN_KEEP_ALIVE);
        let mut keep_alive = tokio::time::interval(period);
        keep_alive.tick().await;

        let work = handler.handle(ctx, job);
        tokio::pin!(work);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = keep_alive.tick() => {
                    if let Err(e) = session.keep_alive() {
                        debug!("Session for {} no longer usable: {}", ctx, e);
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        session: &JobSession,
        ctx: &AttemptContext,
        mut job: JobRecord,
        output: &Value,
    ) -> Result<Option<ProcessOutcome>> {
        let mut finished = job.clone();
        if let Err(e) = finished.mark_completed(Utc::now()) {
            return Ok(Some(skipped(job.id, e.to_string())));
        }

        let validation = self.validator.validate_completion(&finished, Some(output)).await;
        if !validation.is_valid {
            error!("Completion of {} rejected: {}", ctx, validation.error_summary());
            let kind = if validation.has_code(IssueCode::DataIntegrityViolation) {
                FaultKind::DataIntegrity
            } else {
                FaultKind::Validation
            };
            let fault = Fault::new(kind, validation.error_summary());
            return Ok(Some(self.fail(session, ctx, &mut job, &fault).await));
        }

        session.update(&finished).await?;
        info!("Completed {}", ctx);
        Ok(Some(ProcessOutcome::Completed {
            job_id: finished.id,
            validation,
        }))
    }

    async fn fail(
        &self,
        session: &JobSession,
        ctx: &AttemptContext,
        job: &mut JobRecord,
        fault: &Fault,
    ) -> ProcessOutcome {
        let outcome = self.failures.handle_failure(session, ctx, job, fault).await;
        ProcessOutcome::Failed {
            job_id: job.id.clone(),
            outcome,
        }
    }

    async fn claim_next(&self, session: &JobSession, queues: &[String]) -> Result<Option<String>> {
        if self.flags.fallback_mode() {
            return self.claim_from_store(session, queues).await;
        }
        self.queue.promote_due(Utc::now()).await?;
        Ok(self.queue.pop_next(queues).await?.map(|entry| entry.job_id))
    }

    /// Oldest, highest-priority queued record whose retry delay has passed
    ///
    /// Two workers may pick the same record here; the second one sees it
    /// Running and skips it.
    async fn claim_from_store(
        &self,
        session: &JobSession,
        queues: &[String],
    ) -> Result<Option<String>> {
        let now = Utc::now();
        let not_before: HashMap<String, DateTime<Utc>> = match self.queue.pending_retries().await {
            Ok(pending) => pending.into_iter().collect(),
            Err(e) => {
                debug!("Retry schedule unavailable in fallback mode: {}", e);
                HashMap::new()
            }
        };

        let candidates = session
            .list_by_status(JobStatus::Queued, None, FALLBACK_SCAN_LIMIT)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|job| queues.contains(&job.queue_name))
            .filter(|job| not_before.get(&job.id).is_none_or(|ready_at| *ready_at <= now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id))
    }
}

fn skipped(job_id: String, reason: impl Into<String>) -> ProcessOutcome {
    ProcessOutcome::Skipped {
        job_id,
        reason: reason.into(),
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
