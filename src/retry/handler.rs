//! Failure path: classify, decide, then requeue with a delay or quarantine
//!
//! Nothing here propagates an error to the worker. The worst outcome of a
//! failure is a permanently failed job in the dead letter store.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::classify::{classify, Fault, FaultCategory};
use super::policy::{RetryPolicy, StopReason};
use crate::context::AttemptContext;
use crate::dlq::{sanitize_message, DeadLetterStore};
use crate::job::{ErrorRecord, JobRecord};
use crate::storage::JobSession;
use crate::worker::JobQueue;

/// What the failure path did with a job
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retried {
        category: FaultCategory,
        delay: Duration,
        retry_count: u32,
    },
    DeadLettered {
        category: FaultCategory,
        reason: StopReason,
        /// False when the dead letter store could not be written
        admitted: bool,
    },
    /// The job was already terminal, e.g. failed by the stuck-task sweep
    Skipped,
}

pub struct FailureHandler {
    policy: RetryPolicy,
    queue: JobQueue,
    dlq: Arc<DeadLetterStore>,
}

impl FailureHandler {
    pub fn new(policy: RetryPolicy, queue: JobQueue, dlq: Arc<DeadLetterStore>) -> Self {
        Self { policy, queue, dlq }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn handle_failure(
        &self,
        session: &JobSession,
        ctx: &AttemptContext,
        job: &mut JobRecord,
        fault: &Fault,
    ) -> FailureOutcome {
        if job.status.is_terminal() {
            warn!("Ignoring failure of {}: job is already {}", ctx, job.status);
            return FailureOutcome::Skipped;
        }

        let category = classify(fault);
        let attempt = job.retry_count;
        let decision = self.policy.decide(category, attempt, fault);
        let now = Utc::now();
        let record = ErrorRecord {
            occurred_at: now,
            error_type: fault.type_name.clone(),
            category,
            message: sanitize_message(&fault.message, self.dlq.config().max_message_length),
            attempt,
            terminal: !decision.retry,
        };

        match decision.stop_reason {
            None => {
                if let Err(e) = job.requeue_for_retry(now, record) {
                    warn!("Cannot requeue {}: {}", ctx, e);
                    return FailureOutcome::Skipped;
                }
                if let Err(e) = session.update(job).await {
                    error!("Failed to persist retry state for {}: {}", ctx, e);
                }
                let ready_at = now
                    + chrono::Duration::from_std(decision.delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                if let Err(e) = self.queue.schedule(job, ready_at).await {
                    error!("Failed to schedule retry for {}: {}", ctx, e);
                }
                info!(
                    "Retrying {} in {}s ({}, {:?} backoff)",
                    ctx,
                    decision.delay_seconds(),
                    category,
                    decision.strategy
                );
                FailureOutcome::Retried {
                    category,
                    delay: decision.delay,
                    retry_count: job.retry_count,
                }
            }
            Some(reason) => {
                if let Err(e) = job.mark_failed(now, record) {
                    warn!("Cannot fail {}: {}", ctx, e);
                    return FailureOutcome::Skipped;
                }
                if let Err(e) = session.update(job).await {
                    error!("Failed to persist terminal failure for {}: {}", ctx, e);
                }
                warn!(
                    "Job {} failed permanently after {} retries ({}, {:?})",
                    job.id, job.retry_count, category, reason
                );
                let admitted = self
                    .dlq
                    .admit(job, fault, category, job.retry_count, ctx)
                    .await;
                FailureOutcome::DeadLettered {
                    category,
                    reason,
                    admitted,
                }
            }
        }
    }
}
