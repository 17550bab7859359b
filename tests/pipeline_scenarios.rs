//! End-to-end job lifecycles through the public `Services` wiring

mod common;

use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use common::{drop_connection, env, env_with, job, queues, succeed, test_config};
use jobguard::recovery::{CorruptionReport, RecoveryMethod, RecoveryStatus};
use jobguard::retry::{FailureOutcome, FaultCategory, StopReason};
use jobguard::storage::JobStore;
use jobguard::validation::ValidationStage;
use jobguard::worker::ProcessOutcome;
use jobguard::JobStatus;

#[tokio::test]
async fn test_connection_failures_back_off_then_dead_letter() {
    let env = env().await;
    let pipeline = env.services.pipeline();
    assert!(pipeline.enqueue(job("J1")).await.unwrap().is_valid);

    let mut delays = Vec::new();
    loop {
        let outcome = pipeline
            .process_next("w1", &queues(), &drop_connection)
            .await
            .unwrap()
            .expect("a ready job");
        match outcome {
            ProcessOutcome::Failed {
                outcome: FailureOutcome::Retried { delay, category, .. },
                ..
            } => {
                assert_eq!(category, FaultCategory::TransientNetwork);
                delays.push(delay);
                // Jump past the parked delay
                let promoted = env
                    .services
                    .queue
                    .promote_due(Utc::now() + chrono::Duration::hours(1))
                    .await
                    .unwrap();
                assert_eq!(promoted, 1);
            }
            ProcessOutcome::Failed {
                outcome: FailureOutcome::DeadLettered { category, reason, admitted },
                ..
            } => {
                assert_eq!(category, FaultCategory::TransientNetwork);
                assert_eq!(reason, StopReason::MaxRetriesExceeded);
                assert!(admitted);
                break;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    let stored = env.services.store.get("J1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 3);

    let entries = env.services.dlq.list(10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, "J1");
    assert_eq!(entries[0].retry_count, 3);
    assert_eq!(entries[0].error_category, FaultCategory::TransientNetwork);
    assert!(!entries[0].error_message.contains("10.0.0.12"));
    assert_eq!(env.services.queue.total_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dead_letter_store_stays_bounded() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    config.dlq.max_size = 3;
    let env = env_with(config).await;
    let pipeline = env.services.pipeline();

    for i in 0..5 {
        pipeline.enqueue(job(&format!("job-{}", i))).await.unwrap();
        pipeline
            .process_next("w1", &queues(), &drop_connection)
            .await
            .unwrap()
            .unwrap();
    }

    let stats = env.services.dlq.stats().await.unwrap();
    assert_eq!(stats.current_size, 3);
    assert_eq!(stats.total_ever_admitted, 5);
    let newest: Vec<String> = env
        .services
        .dlq
        .list(10, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.job_id)
        .collect();
    assert_eq!(newest, vec!["job-4", "job-3", "job-2"]);

    // Nothing is old enough to purge yet
    assert_eq!(env.services.dlq.purge_older_than(1).await.unwrap(), 0);
    assert!(env.services.dlq.clear().await);
    assert_eq!(env.services.dlq.stats().await.unwrap().current_size, 0);
}

#[tokio::test]
async fn test_settings_changed_after_enqueue_is_quarantined() {
    let env = env().await;
    let pipeline = env.services.pipeline();
    pipeline.enqueue(job("J2")).await.unwrap();

    let mut tampered = env.services.store.get("J2").await.unwrap().unwrap();
    tampered.settings.insert("max_length".to_string(), json!(150));
    env.services.store.update(&tampered).await.unwrap();

    let outcome = pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            outcome: FailureOutcome::DeadLettered {
                category: FaultCategory::TaskValidation,
                ..
            },
            ..
        }
    ));

    let entries = env.services.dlq.list(1, 0).await.unwrap();
    assert_eq!(entries[0].error_type, "DataIntegrityViolation");
    assert_eq!(entries[0].retry_count, 0);
    let stats = env.services.validator.cache().stats().await.unwrap();
    assert_eq!(stats.stages[&ValidationStage::Processing].invalid, 1);
}

#[tokio::test]
async fn test_corrupted_record_is_repaired_and_then_processed() {
    let env = env().await;
    let pipeline = env.services.pipeline();
    pipeline.enqueue(job("J3")).await.unwrap();

    let session = env.services.sessions.acquire("operator");
    let mut corrupted = session.get("J3").await.unwrap().unwrap();
    corrupted.settings.remove("max_length");
    corrupted.owner_id = 0;
    session.update(&corrupted).await.unwrap();

    let result = env
        .services
        .recovery
        .recover_corrupted(&session, "J3", &CorruptionReport::new("owner and settings lost"))
        .await;
    assert_eq!(result.method_used, Some(RecoveryMethod::PartialRecovery));
    assert_eq!(result.status, RecoveryStatus::PartialSuccess);
    assert!(result.validation_passed);

    let outcome = pipeline
        .process_next("w1", &queues(), &succeed)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    let stored = env.services.store.get("J3").await.unwrap().unwrap();
    assert_eq!(stored.owner_id, common::OWNER);
    assert_eq!(stored.status, JobStatus::Completed);

    let audit = env.services.recovery.audit().stats().await.unwrap();
    assert_eq!(audit.total_attempts, 1);
}

#[tokio::test]
async fn test_worker_pool_drains_the_queue_and_stops() {
    let mut config = test_config();
    config.workers.poll_interval = Duration::from_millis(10);
    let env = env_with(config).await;
    let pipeline = env.services.pipeline();
    for i in 0..4 {
        pipeline.enqueue(job(&format!("job-{}", i))).await.unwrap();
    }

    let pool = env.services.worker_pool(std::sync::Arc::new(succeed));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(pool.run(2, rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let completed = env
            .services
            .store
            .list_by_status(JobStatus::Completed, None, 100)
            .await
            .unwrap();
        if completed.len() == 4 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs not drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
