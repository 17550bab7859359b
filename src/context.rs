//! Per-attempt context passed explicitly through the processing call chain

use std::fmt;
use uuid::Uuid;

use crate::job::JobRecord;

/// Identifies one processing attempt of one job
///
/// Created by the worker when it pops a job and threaded through validation,
/// the handler and the failure path so every log line and stored record of the
/// attempt shares a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub correlation_id: String,
    pub job_id: String,
    /// Zero-based; equals the job's retry count when the attempt started
    pub attempt: u32,
    pub worker_name: String,
    pub queue_name: String,
}

impl AttemptContext {
    pub fn new(job: &JobRecord, worker_name: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            attempt: job.retry_count,
            worker_name: worker_name.into(),
            queue_name: job.queue_name.clone(),
        }
    }

    /// Context for work not driven by a worker (operator actions, recovery)
    pub fn detached(job_id: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            attempt: 0,
            worker_name: origin.into(),
            queue_name: crate::job::DEFAULT_QUEUE.to_string(),
        }
    }
}

impl fmt::Display for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job={} attempt={} worker={} corr={}",
            self.job_id, self.attempt, self.worker_name, self.correlation_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_tracks_retry_count() {
        let mut job = JobRecord::new("job-7", 1, 2).with_queue("captions");
        job.retry_count = 2;
        let ctx = AttemptContext::new(&job, "worker-a");
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.queue_name, "captions");
        assert!(ctx.to_string().contains("job=job-7 attempt=2"));
        assert_ne!(ctx.correlation_id, AttemptContext::new(&job, "worker-a").correlation_id);
    }
}
