use super::*;
use crate::config::ValidationConfig;
use crate::job::JobStatus;
use crate::storage::{JobStore, MemoryBackend, MemoryJobStore, SessionManager};
use crate::validation::{IntegrityValidator, ValidationCache};
use serde_json::json;
use std::time::Duration;

struct Fixture {
    backend: Arc<dyn QueueBackend>,
    engine: RecoveryEngine,
    sessions: SessionManager,
    validator: Arc<IntegrityValidator>,
}

async fn fixture() -> Fixture {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::default());
    let store = Arc::new(MemoryJobStore::new());
    store.add_connection(9, 5).await;
    store.add_connection(11, 6).await;
    let store: Arc<dyn JobStore> = store;

    let validator = Arc::new(IntegrityValidator::new(
        ValidationConfig::default(),
        ValidationCache::new(backend.clone(), Duration::from_secs(3600)),
    ));
    let engine = RecoveryEngine::new(
        BackupStore::new(backend.clone(), Duration::from_secs(3600)),
        validator.clone(),
        AuditLog::new(backend.clone(), 100),
    );
    Fixture {
        backend,
        engine,
        sessions: SessionManager::new(store, Duration::from_secs(300)),
        validator,
    }
}

/// Enqueue-validate and insert a job, returning it as stored
async fn admitted(fx: &Fixture, id: &str) -> JobRecord {
    let session = fx.sessions.acquire("setup");
    let mut job = JobRecord::new(id, 5, 9);
    assert!(fx.validator.validate_for_enqueue(&session, &mut job).await.is_valid);
    session.insert(&job).await.unwrap();
    job
}

fn report() -> CorruptionReport {
    CorruptionReport::new("integrity hash mismatch")
}

#[tokio::test]
async fn test_restore_from_backup_wins_when_available() {
    let fx = fixture().await;
    let job = admitted(&fx, "J1").await;
    assert!(fx.engine.backups().create(&job).await);

    let session = fx.sessions.acquire("test");
    let mut corrupted = job.clone();
    corrupted.settings.insert("max_length".to_string(), json!("lots"));
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J1", &report()).await;
    assert_eq!(result.status, RecoveryStatus::Success);
    assert_eq!(result.method_used, Some(RecoveryMethod::RestoreFromBackup));
    assert!(result.validation_passed);

    let stored = session.get("J1").await.unwrap().unwrap();
    assert_eq!(stored.settings, job.settings);
}

#[tokio::test]
async fn test_tampered_backup_falls_through_to_partial_recovery() {
    let fx = fixture().await;
    let job = admitted(&fx, "J2").await;
    let session = fx.sessions.acquire("test");

    let mut snapshot = BackupSnapshot::capture(&job);
    snapshot.priority = crate::job::Priority::Urgent;
    crate::storage::set_json(fx.backend.as_ref(), "backup:J2", &snapshot, None)
        .await
        .unwrap();

    let result = fx.engine.recover_corrupted(&session, "J2", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::PartialRecovery));
    assert!(result.notes.iter().any(|n| n.contains("checksum mismatch")));
}

#[tokio::test]
async fn test_partial_recovery_before_reset() {
    let fx = fixture().await;
    let job = admitted(&fx, "J3").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted.settings.remove("max_length");
    corrupted.owner_id = 0;
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J3", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::PartialRecovery));
    assert_eq!(result.status, RecoveryStatus::PartialSuccess);
    assert!(result.validation_passed);
    assert!(result
        .notes
        .iter()
        .any(|n| n.contains("owner_id 5 derived from connection 9")));
    assert!(result
        .notes
        .iter()
        .any(|n| n.contains("operation log reconstruction is not available")));

    let stored = session.get("J3").await.unwrap().unwrap();
    assert_eq!(stored.owner_id, 5);
    assert_eq!(stored.settings.get("max_length"), Some(&json!(280)));
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_partial_recovery_restores_out_of_range_settings() {
    let fx = fixture().await;
    let job = admitted(&fx, "J9").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted.settings.insert("max_length".to_string(), json!(999999));
    corrupted.settings.insert("language".to_string(), json!("klingon"));
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J9", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::PartialRecovery));
    assert_eq!(result.status, RecoveryStatus::PartialSuccess);
    assert!(result.validation_passed);
    assert!(result
        .notes
        .iter()
        .any(|n| n.contains("settings.max_length 999999 outside 10..=2000")));
    assert!(result
        .notes
        .iter()
        .any(|n| n.contains("'klingon' is not a language code")));

    let mut stored = session.get("J9").await.unwrap().unwrap();
    assert_eq!(stored.settings.get("max_length"), Some(&json!(280)));
    assert_eq!(stored.settings.get("language"), Some(&json!("en")));
    stored.integrity_hash = None;
    assert!(fx.validator.validate_for_enqueue(&session, &mut stored).await.is_valid);
}

#[tokio::test]
async fn test_repaired_record_with_dangerous_extras_fails_revalidation() {
    let fx = fixture().await;
    let job = admitted(&fx, "J10").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted
        .settings
        .insert("hints".to_string(), json!({"note": "<script>alert(1)</script>"}));
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J10", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::PartialRecovery));
    assert!(!result.validation_passed);
}

#[tokio::test]
async fn test_rejected_restore_keeps_the_enqueue_baseline() {
    let fx = fixture().await;
    let job = admitted(&fx, "J8").await;
    let baseline = fx.validator.cache().enqueue_hash("J8").await;
    assert_eq!(baseline, job.integrity_hash);

    let mut bad_backup = job.clone();
    bad_backup.settings.insert("max_length".to_string(), json!(999999));
    assert!(fx.engine.backups().create(&bad_backup).await);

    let session = fx.sessions.acquire("test");
    let mut corrupted = job.clone();
    corrupted.owner_id = 0;
    corrupted.connection_id = 0;
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J8", &report()).await;
    assert_eq!(result.status, RecoveryStatus::NotRecoverable);
    assert!(result
        .notes
        .iter()
        .any(|n| n.contains("restored record failed validation")));
    assert_eq!(fx.validator.cache().enqueue_hash("J8").await, baseline);
}

#[tokio::test]
async fn test_successful_recovery_rebases_the_enqueue_baseline() {
    let fx = fixture().await;
    let job = admitted(&fx, "J11").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted.settings.remove("language");
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J11", &report()).await;
    let recovered = result.recovered_data.unwrap();
    assert_eq!(
        fx.validator.cache().enqueue_hash("J11").await,
        recovered.integrity_hash
    );
}

#[tokio::test]
async fn test_inconsistent_ownership_resets_to_defaults() {
    let fx = fixture().await;
    let job = admitted(&fx, "J4").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted.connection_id = 11;
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J4", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::ResetToDefaults));
    assert_eq!(result.status, RecoveryStatus::Failed);
    assert!(result.validation_passed);

    assert!(result.ensure_recovered().is_ok());

    let stored = session.get("J4").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.completed_at.is_some());
    assert!(stored.error_message.last().unwrap().terminal);
}

#[tokio::test]
async fn test_missing_identifiers_are_not_recoverable() {
    let fx = fixture().await;
    let job = admitted(&fx, "J5").await;
    let session = fx.sessions.acquire("test");

    let mut corrupted = job.clone();
    corrupted.owner_id = 0;
    corrupted.connection_id = 0;
    session.update(&corrupted).await.unwrap();

    let result = fx.engine.recover_corrupted(&session, "J5", &report()).await;
    assert_eq!(result.status, RecoveryStatus::NotRecoverable);
    assert!(result.method_used.is_none());
    assert!(result.recovered_data.is_none());

    let err = result.ensure_recovered().unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::RECOVERY_NOT_RECOVERABLE);
    assert_eq!(err.exit_code(), 9);
}

#[tokio::test]
async fn test_deleted_record_is_rebuilt_from_backup() {
    let fx = fixture().await;
    let job = JobRecord::new("J6", 5, 9);
    assert!(fx.engine.backups().create(&job).await);

    let session = fx.sessions.acquire("test");
    let result = fx.engine.recover_corrupted(&session, "J6", &report()).await;
    assert_eq!(result.method_used, Some(RecoveryMethod::RestoreFromBackup));
    assert!(session.exists("J6").await.unwrap());
}

#[tokio::test]
async fn test_every_attempt_is_audited() {
    let fx = fixture().await;
    admitted(&fx, "J7").await;
    let session = fx.sessions.acquire("test");

    fx.engine.recover_corrupted(&session, "J7", &report()).await;
    fx.engine.recover_corrupted(&session, "missing", &report()).await;

    let log = fx.engine.audit().recent(10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(fx.engine.audit().recent(usize::MAX).await.unwrap().len(), 2);
    assert_eq!(log[0].job_id, "missing");
    assert_eq!(log[0].status, RecoveryStatus::NotRecoverable);

    let stats = fx.engine.audit().stats().await.unwrap();
    assert_eq!(stats.total_attempts, 2);
    assert_eq!(stats.by_method.get("PartialRecovery"), Some(&1));
    assert_eq!(stats.validation_pass_rate, Some(50.0));
}
