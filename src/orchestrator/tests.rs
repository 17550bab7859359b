use super::*;
use crate::config::{DlqConfig, ValidationConfig};
use crate::job::{ErrorRecord, JobRecord};
use crate::recovery::{AuditLog, BackupStore};
use crate::retry::FaultCategory;
use crate::storage::{JobStore, MemoryBackend, MemoryJobStore};
use crate::validation::{IntegrityValidator, ValidationCache};
use crate::worker::{WorkerCommand, WorkerHeartbeat, WorkerState};
use std::str::FromStr;
use std::time::Duration;

struct Fixture {
    orchestrator: Orchestrator,
    backend: Arc<MemoryBackend>,
    store: Arc<MemoryJobStore>,
    queue: JobQueue,
    control: WorkerControl,
}

async fn fixture() -> Fixture {
    let backend = Arc::new(MemoryBackend::default());
    let dyn_backend: Arc<dyn QueueBackend> = backend.clone();
    let store = Arc::new(MemoryJobStore::new());
    store.add_connection(9, 5).await;

    let sessions = SessionManager::new(store.clone(), Duration::from_secs(60));
    let queue = JobQueue::new(dyn_backend.clone());
    let dlq = Arc::new(DeadLetterStore::new(dyn_backend.clone(), DlqConfig::default()));
    let validator = Arc::new(IntegrityValidator::new(
        ValidationConfig::default(),
        ValidationCache::new(dyn_backend.clone(), Duration::from_secs(60)),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        BackupStore::new(dyn_backend.clone(), Duration::from_secs(60)),
        validator,
        AuditLog::new(dyn_backend.clone(), 50),
    ));
    let control = WorkerControl::new(dyn_backend.clone(), Duration::from_secs(60));

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        dyn_backend,
        sessions,
        queue.clone(),
        dlq,
        recovery,
        control.clone(),
        RuntimeFlags::new(),
    );
    Fixture {
        orchestrator,
        backend,
        store,
        queue,
        control,
    }
}

async fn live_worker(control: &WorkerControl, name: &str) {
    control
        .publish_heartbeat(&WorkerHeartbeat {
            name: name.to_string(),
            queues: vec!["default".to_string()],
            last_seen: Utc::now(),
            jobs_processed: 0,
            state: WorkerState::Idle,
        })
        .await;
}

fn failure(category: FaultCategory, error_type: &str) -> ErrorRecord {
    ErrorRecord {
        occurred_at: Utc::now(),
        error_type: error_type.to_string(),
        category,
        message: "boom".to_string(),
        attempt: 3,
        terminal: true,
    }
}

#[tokio::test]
async fn test_diagnose_healthy_system() {
    let fx = fixture().await;
    live_worker(&fx.control, "w-1").await;

    let report = fx.orchestrator.diagnose().await;
    assert_eq!(report.overall_health, HealthLevel::Healthy, "{:?}", report.issues);
    assert!(report.issues.is_empty());
    assert!(report.suggested_actions.is_empty());
    assert_eq!(report.components.len(), 5);
    assert_eq!(
        report.components[diagnosis::COMPONENT_WORKERS].details["live_workers"],
        serde_json::json!(1)
    );
}

#[tokio::test]
async fn test_diagnose_unreachable_backend_is_critical() {
    let fx = fixture().await;
    fx.backend.set_available(false);

    let report = fx.orchestrator.diagnose().await;
    assert_eq!(report.overall_health, HealthLevel::Critical);
    let backend_issues: Vec<_> = report.issues_for(diagnosis::COMPONENT_BACKEND).collect();
    assert_eq!(backend_issues.len(), 1);
    assert_eq!(backend_issues[0].severity, HealthLevel::Critical);
    assert!(report
        .suggested_actions
        .contains(&RecoveryAction::MigrateToFallbackStore));
    // Store is unaffected
    assert_eq!(
        report.components[diagnosis::COMPONENT_STORE].health,
        HealthLevel::Healthy
    );
}

#[tokio::test]
async fn test_clear_stuck_tasks_fails_overdue_running_jobs() {
    let fx = fixture().await;
    let mut stuck = JobRecord::new("stuck", 5, 9);
    stuck
        .mark_running(Utc::now() - chrono::Duration::hours(2))
        .unwrap();
    fx.store.insert(&stuck).await.unwrap();
    let mut fresh = JobRecord::new("fresh", 5, 9);
    fresh.mark_running(Utc::now()).unwrap();
    fx.store.insert(&fresh).await.unwrap();

    let diagnosis = fx.orchestrator.diagnose().await;
    assert!(diagnosis
        .suggested_actions
        .contains(&RecoveryAction::ClearStuckTasks));

    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::ClearStuckTasks])
        .await;
    assert_eq!(report.overall_status, PlanStatus::Success);
    assert_eq!(report.results[0].details["job_ids"], serde_json::json!(["stuck"]));

    let stuck = fx.store.get("stuck").await.unwrap().unwrap();
    assert_eq!(stuck.status, JobStatus::Failed);
    let record = stuck.error_message.last().unwrap();
    assert_eq!(record.error_type, "StuckTaskTimeout");
    assert!(record.terminal);
    assert_eq!(
        fx.store.get("fresh").await.unwrap().unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn test_failed_action_does_not_abort_the_plan() {
    let fx = fixture().await;
    fx.backend.set_available(false);

    let report = fx
        .orchestrator
        .execute_plan(&[
            RecoveryAction::MigrateBackToQueue,
            RecoveryAction::MigrateToFallbackStore,
        ])
        .await;

    assert_eq!(report.overall_status, PlanStatus::PartialSuccess);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 1);
    assert!(!report.results[0].success);
    assert!(report.results[0].message.contains("unreachable"));
    assert!(report.results[1].success);
    assert!(!report.before.fallback_mode);
    assert!(report.after.fallback_mode);
    assert!(!report.after.backend_reachable);
}

#[tokio::test]
async fn test_fallback_round_trip_requeues_store_jobs() {
    let fx = fixture().await;
    let job = JobRecord::new("job-1", 5, 9);
    fx.store.insert(&job).await.unwrap();
    fx.queue.enqueue(&job).await.unwrap();

    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::MigrateToFallbackStore])
        .await;
    assert_eq!(report.overall_status, PlanStatus::Success);
    assert_eq!(fx.queue.total_depth().await.unwrap(), 0);
    assert!(fx.orchestrator.flags().fallback_mode());

    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::MigrateBackToQueue])
        .await;
    assert_eq!(report.overall_status, PlanStatus::Success);
    assert_eq!(fx.queue.total_depth().await.unwrap(), 1);
    assert!(!fx.orchestrator.flags().fallback_mode());

    let plans = fx.orchestrator.recent_plans(10).await.unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(fx.orchestrator.recent_plans(usize::MAX).await.unwrap().len(), 2);
    assert_eq!(plans[0].plan_id, report.plan_id);
}

#[tokio::test]
async fn test_retry_failed_tasks_skips_non_retryable_failures() {
    let fx = fixture().await;
    let mut transient = JobRecord::new("transient", 5, 9);
    transient
        .mark_failed(Utc::now(), failure(FaultCategory::TransientNetwork, "ConnectionError"))
        .unwrap();
    fx.store.insert(&transient).await.unwrap();
    let mut invalid = JobRecord::new("invalid", 5, 9);
    invalid
        .mark_failed(Utc::now(), failure(FaultCategory::TaskValidation, "ValidationError"))
        .unwrap();
    fx.store.insert(&invalid).await.unwrap();

    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::RetryFailedTasks])
        .await;
    assert_eq!(report.overall_status, PlanStatus::Success);
    assert_eq!(report.results[0].details["skipped"], serde_json::json!(1));

    let reopened = fx.store.get("transient").await.unwrap().unwrap();
    assert_eq!(reopened.status, JobStatus::Queued);
    assert_eq!(reopened.retry_count, 0);
    assert_eq!(reopened.error_message.len(), 1);
    assert_eq!(fx.queue.total_depth().await.unwrap(), 1);
    assert_eq!(
        fx.store.get("invalid").await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_emergency_shutdown_halts_and_stops_workers() {
    let fx = fixture().await;
    live_worker(&fx.control, "w-1").await;
    let _held = fx.orchestrator.sessions.acquire("worker w-1");

    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::EmergencyShutdown])
        .await;
    assert_eq!(report.overall_status, PlanStatus::Success);
    assert!(fx.orchestrator.flags().processing_halted());
    assert!(fx.orchestrator.flags().fallback_mode());
    assert_eq!(
        fx.control.next_command("w-1").await.unwrap(),
        Some(WorkerCommand::Stop)
    );
    assert_eq!(report.results[0].details["sessions_revoked"], serde_json::json!(1));

    let diagnosis = fx.orchestrator.diagnose().await;
    assert!(diagnosis
        .issues_for(diagnosis::COMPONENT_WORKERS)
        .any(|i| i.severity == HealthLevel::Unhealthy));
}

#[tokio::test]
async fn test_scale_to_zero_is_refused() {
    let fx = fixture().await;
    let report = fx
        .orchestrator
        .execute_plan(&[RecoveryAction::ScaleWorkers(0), RecoveryAction::ScaleWorkers(3)])
        .await;
    assert_eq!(report.overall_status, PlanStatus::PartialSuccess);
    assert!(!report.results[0].success);
    assert!(report.results[1].success);
}

#[test]
fn test_action_parsing() {
    assert_eq!(
        RecoveryAction::from_str("clear_stuck_tasks").unwrap(),
        RecoveryAction::ClearStuckTasks
    );
    assert_eq!(
        RecoveryAction::from_str(" Scale_Workers:4 ").unwrap(),
        RecoveryAction::ScaleWorkers(4)
    );
    assert_eq!(RecoveryAction::ScaleWorkers(4).to_string(), "scale_workers:4");
    assert!(RecoveryAction::from_str("scale_workers").is_err());
    assert!(RecoveryAction::from_str("scale_workers:many").is_err());
    assert!(RecoveryAction::from_str("reboot_everything").is_err());

    for action in RecoveryAction::catalog() {
        if !matches!(action, RecoveryAction::ScaleWorkers(_)) {
            assert_eq!(RecoveryAction::from_str(&action.to_string()).unwrap(), action);
        }
    }
}

#[test]
fn test_every_action_is_documented() {
    let docs = Orchestrator::action_docs();
    assert_eq!(docs.len(), 10);
    assert!(docs.iter().all(|d| !d.description.is_empty() && !d.when_to_use.is_empty()));
    let shutdown = docs.iter().find(|d| d.name == "emergency_shutdown").unwrap();
    assert_eq!(shutdown.risk, RiskLevel::Critical);
}
