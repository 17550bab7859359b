//! Cross-cutting tests for the storage layer
use crate::job::JobRecord;
use crate::storage::backends::{MemoryBackend, MemoryJobStore};
use crate::storage::config::MemoryConfig;
use crate::storage::traits::{JobStore, QueueBackend};
use crate::storage::types::{BatchOp, BatchReply};
use crate::storage::{get_json, page_bounds, set_json};
use std::sync::Arc;
use std::time::Duration;

/// Create a test job
fn create_test_job(id: &str) -> JobRecord {
    JobRecord::new(id, 5, 9)
}

#[tokio::test]
async fn test_json_helpers_round_trip_job() {
    let backend = MemoryBackend::default();
    let job = create_test_job("job-1");
    set_json(&backend, "snapshot:job-1", &job, Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let loaded: Option<JobRecord> = get_json(&backend, "snapshot:job-1").await.unwrap();
    assert_eq!(loaded, Some(job));
    let missing: Option<JobRecord> = get_json(&backend, "snapshot:none").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_concurrent_trimmed_pushes_respect_bound() {
    let backend = Arc::new(MemoryBackend::default());
    let mut handles = Vec::new();
    for worker in 0..8 {
        let backend = Arc::clone(&backend);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                backend
                    .push_trimmed("bounded", &format!("{}-{}", worker, i), 50)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(backend.list_len("bounded").await.unwrap(), 50);
}

#[tokio::test]
async fn test_batch_replies_follow_op_order() {
    let backend = MemoryBackend::default();
    let replies = backend
        .execute_batch(vec![
            BatchOp::PushTrimmed {
                key: "ring".to_string(),
                value: "a".to_string(),
                max_len: 10,
            },
            BatchOp::IncrBy {
                key: "count".to_string(),
                delta: 3,
            },
            BatchOp::Expire {
                key: "ring".to_string(),
                ttl: Duration::from_secs(30),
            },
        ])
        .await
        .unwrap();
    assert_eq!(
        replies,
        vec![BatchReply::Length(1), BatchReply::Counter(3), BatchReply::Ok]
    );
}

#[tokio::test]
async fn test_info_reports_configured_ceiling() {
    let backend = MemoryBackend::new(MemoryConfig { max_memory: 1000 });
    backend.set("k", "0123456789", None).await.unwrap();
    let info = backend.info().await.unwrap();
    assert_eq!(info.max_memory_bytes, 1000);
    assert!(info.used_memory_bytes >= 10);
    assert!(info.memory_usage_percent().unwrap() > 0.0);
}

#[tokio::test]
async fn test_job_store_counts_terminal_jobs_by_completion() {
    let store = MemoryJobStore::new();
    let hour_ago = chrono::Utc::now() - chrono::Duration::hours(1);

    let mut done = create_test_job("done");
    done.created_at = hour_ago - chrono::Duration::hours(5);
    done.mark_running(hour_ago - chrono::Duration::hours(5)).unwrap();
    done.mark_completed(chrono::Utc::now()).unwrap();
    store.insert(&done).await.unwrap();

    let count = store
        .count_by_status_since(crate::job::JobStatus::Completed, hour_ago)
        .await
        .unwrap();
    assert_eq!(count, 1);
    let times = store.processing_times_since(hour_ago).await.unwrap();
    assert_eq!(times.len(), 1);
    assert!(times[0] >= 5.0 * 3600.0 - 1.0);
}

#[test]
fn test_page_bounds_clamp_instead_of_overflowing() {
    assert_eq!(page_bounds(2, 3), Some((2, 4)));
    assert_eq!(page_bounds(0, 0), None);
    assert_eq!(page_bounds(0, usize::MAX), Some((0, isize::MAX)));
    assert_eq!(page_bounds(5, usize::MAX), Some((5, isize::MAX)));
    assert_eq!(page_bounds(usize::MAX, 1), None);
}
