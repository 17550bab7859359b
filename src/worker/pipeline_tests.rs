use super::*;
use crate::config::{DlqConfig, RetryConfig, ValidationConfig};
use crate::dlq::DeadLetterStore;
use crate::job::ErrorRecord;
use crate::retry::{FaultCategory, RetryPolicy, StopReason};
use crate::storage::{JobStore, MemoryBackend, MemoryJobStore, QueueBackend};
use crate::validation::ValidationCache;
use serde_json::json;
use std::time::Duration;

struct Fixture {
    pipeline: JobPipeline,
    store: Arc<dyn JobStore>,
    dlq: Arc<DeadLetterStore>,
}

async fn fixture() -> Fixture {
    fixture_with_idle_timeout(Duration::from_secs(60)).await
}

async fn fixture_with_idle_timeout(idle_timeout: Duration) -> Fixture {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::default());
    let memory_store = Arc::new(MemoryJobStore::new());
    memory_store.add_connection(9, 5).await;
    let store: Arc<dyn JobStore> = memory_store;

    let queue = JobQueue::new(backend.clone());
    let dlq = Arc::new(DeadLetterStore::new(backend.clone(), DlqConfig::default()));
    let validator = Arc::new(IntegrityValidator::new(
        ValidationConfig::default(),
        ValidationCache::new(backend.clone(), Duration::from_secs(60)),
    ));
    let policy = RetryPolicy::new(RetryConfig {
        base_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    });
    let failures = Arc::new(FailureHandler::new(policy, queue.clone(), dlq.clone()));
    let pipeline = JobPipeline::new(
        SessionManager::new(store.clone(), idle_timeout),
        queue,
        validator,
        BackupStore::new(backend, Duration::from_secs(60)),
        failures,
        RuntimeFlags::new(),
    );
    Fixture {
        pipeline,
        store,
        dlq,
    }
}

fn queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn succeed(_job: &JobRecord) -> std::result::Result<Value, Fault> {
    Ok(json!({"caption": "a dog on a beach"}))
}

fn drop_connection(_job: &JobRecord) -> std::result::Result<Value, Fault> {
    Err(Fault::new(FaultKind::ConnectionError, "connection reset by peer"))
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_job_without_storing_it() {
    let fx = fixture().await;
    let result = fx.pipeline.enqueue(JobRecord::new("bad", 5, 77)).await.unwrap();

    assert!(!result.is_valid);
    assert!(result.has_code(IssueCode::ConnectionNotFound));
    assert!(fx.store.get("bad").await.unwrap().is_none());
    assert_eq!(fx.pipeline.queue().total_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_successful_job_completes_with_valid_result() {
    let fx = fixture().await;
    let result = fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(fx.pipeline.queue().total_depth().await.unwrap(), 1);

    let outcome = fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    match outcome {
        ProcessOutcome::Completed { job_id, validation } => {
            assert_eq!(job_id, "job-1");
            assert!(validation.is_valid);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let stored = fx.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.started_at.is_some() && stored.completed_at.is_some());
    assert!(fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_transient_failure_is_parked_for_retry() {
    let fx = fixture().await;
    fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();

    let outcome = fx
        .pipeline
        .process_next("w1", &queues(), &drop_connection)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            outcome: FailureOutcome::Retried { retry_count: 1, .. },
            ..
        }
    ));

    // Parked, not ready
    assert!(fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.pipeline.queue().delayed_len().await.unwrap(), 1);
    let stored = fx.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_tampered_record_is_never_retried() {
    let fx = fixture().await;
    fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();

    let mut tampered = fx.store.get("job-1").await.unwrap().unwrap();
    tampered.settings.insert("max_length".to_string(), json!(1999));
    fx.store.update(&tampered).await.unwrap();

    let outcome = fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    match outcome {
        ProcessOutcome::Failed {
            outcome: FailureOutcome::DeadLettered { category, reason, admitted },
            ..
        } => {
            assert_eq!(category, FaultCategory::TaskValidation);
            assert_eq!(reason, StopReason::NonRetryableCategory);
            assert!(admitted);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let stored = fx.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let entries = fx.dlq.list(10, 0).await.unwrap();
    assert_eq!(entries[0].error_type, "DataIntegrityViolation");
}

struct SweptMidFlight {
    store: Arc<dyn JobStore>,
}

#[async_trait]
impl JobHandler for SweptMidFlight {
    async fn handle(&self, _ctx: &AttemptContext, job: &JobRecord) -> std::result::Result<Value, Fault> {
        let mut swept = job.clone();
        swept
            .mark_failed(
                Utc::now(),
                ErrorRecord {
                    occurred_at: Utc::now(),
                    error_type: "StuckTaskTimeout".to_string(),
                    category: FaultCategory::SystemError,
                    message: "task exceeded the stuck threshold".to_string(),
                    attempt: 0,
                    terminal: true,
                },
            )
            .unwrap();
        self.store.update(&swept).await.unwrap();
        Ok(json!("late result"))
    }
}

#[tokio::test]
async fn test_result_of_externally_failed_job_is_abandoned() {
    let fx = fixture().await;
    fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();
    let handler = SweptMidFlight {
        store: fx.store.clone(),
    };

    let outcome = fx
        .pipeline
        .process_next("w1", &queues(), &handler)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));

    let stored = fx.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.last().unwrap().error_type, "StuckTaskTimeout");
    assert_eq!(fx.dlq.stats().await.unwrap().current_size, 0);
}

struct OutlastsIdleTimeout {
    sessions: SessionManager,
    reaped: std::sync::Mutex<usize>,
}

#[async_trait]
impl JobHandler for OutlastsIdleTimeout {
    async fn handle(&self, _ctx: &AttemptContext, _job: &JobRecord) -> std::result::Result<Value, Fault> {
        tokio::time::sleep(self.sessions.idle_timeout() * 3 / 2).await;
        *self.reaped.lock().unwrap() = self.sessions.reap_idle();
        Ok(json!({"caption": "slow but fine"}))
    }
}

#[tokio::test]
async fn test_handler_longer_than_idle_timeout_keeps_its_session() {
    let fx = fixture_with_idle_timeout(Duration::from_millis(100)).await;
    fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();
    let handler = OutlastsIdleTimeout {
        sessions: fx.pipeline.sessions().clone(),
        reaped: std::sync::Mutex::new(0),
    };

    let outcome = fx
        .pipeline
        .process_next("w1", &queues(), &handler)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    assert_eq!(*handler.reaped.lock().unwrap(), 0);

    let stored = fx.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_fallback_mode_reads_from_the_store() {
    let fx = fixture().await;
    fx.pipeline.flags().set_fallback_mode(true);
    fx.pipeline.enqueue(JobRecord::new("old", 5, 9)).await.unwrap();
    fx.pipeline
        .enqueue(JobRecord::new("urgent", 5, 9).with_priority(crate::job::Priority::Urgent))
        .await
        .unwrap();
    assert_eq!(fx.pipeline.queue().total_depth().await.unwrap(), 0);

    let first = fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job_id(), "urgent");
    let second = fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job_id(), "old");
}

#[tokio::test]
async fn test_halted_pipeline_takes_nothing() {
    let fx = fixture().await;
    fx.pipeline.enqueue(JobRecord::new("job-1", 5, 9)).await.unwrap();
    fx.pipeline.flags().set_processing_halted(true);

    assert!(fx
        .pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.pipeline.queue().total_depth().await.unwrap(), 1);
}
