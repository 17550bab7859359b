//! Repair of corrupted job records
//!
//! Strategies run in a fixed order and the first one that applies wins:
//! restore from backup, reconstruct from operation logs, field-level partial
//! repair, and finally reset to defaults (which sacrifices the job by failing
//! it). Every attempt lands in the audit log.

use chrono::Utc;
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::backup::BackupStore;
use super::{
    AuditLog, CorruptionReport, RecoveryLogEntry, RecoveryMethod, RecoveryResult, RecoveryStatus,
};
use crate::context::AttemptContext;
use crate::job::settings::{is_language_code, LANGUAGE_KEY, MAX_LENGTH_KEY};
use crate::job::{compute_integrity_hash, ErrorRecord, JobRecord, JobSettings, JobStatus};
use crate::retry::FaultCategory;
use crate::storage::{JobSession, StorageResult};
use crate::validation::IntegrityValidator;

/// What a strategy produced when it applied
struct Repair {
    job: JobRecord,
    status: RecoveryStatus,
    notes: Vec<String>,
}

pub struct RecoveryEngine {
    backups: BackupStore,
    validator: Arc<IntegrityValidator>,
    audit: AuditLog,
}

impl RecoveryEngine {
    pub fn new(backups: BackupStore, validator: Arc<IntegrityValidator>, audit: AuditLog) -> Self {
        Self {
            backups,
            validator,
            audit,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn recover_corrupted(
        &self,
        session: &JobSession,
        job_id: &str,
        report: &CorruptionReport,
    ) -> RecoveryResult {
        let ctx = AttemptContext::detached(job_id, "recovery");
        info!("Recovering {} ({})", ctx, report.description);

        let live = match session.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                error!("Cannot load job {} for recovery: {}", job_id, e);
                let result = RecoveryResult::new(job_id, RecoveryStatus::Failed, None)
                    .with_note(format!("job store unreachable: {}", e));
                return self.finish(&ctx, result).await;
            }
        };

        let mut notes = Vec::new();
        for method in RecoveryMethod::ORDER {
            let attempt = match method {
                RecoveryMethod::RestoreFromBackup => {
                    self.restore_from_backup(job_id, live.as_ref(), &mut notes).await
                }
                RecoveryMethod::ReconstructFromLogs => {
                    notes.push("operation log reconstruction is not available".to_string());
                    None
                }
                RecoveryMethod::PartialRecovery => {
                    self.partial_recovery(session, live.as_ref(), &mut notes).await
                }
                RecoveryMethod::ResetToDefaults => reset_to_defaults(live.as_ref(), &mut notes),
            };

            let Some(repair) = attempt else { continue };
            notes.extend(repair.notes);

            let hash = compute_integrity_hash(&repair.job);
            let mut job = repair.job;
            job.integrity_hash = Some(hash.clone());
            let validation = self.validator.revalidate(&job).await;

            if method == RecoveryMethod::RestoreFromBackup && !validation.is_valid {
                notes.push(format!(
                    "restored record failed validation: {}",
                    validation.error_summary()
                ));
                continue;
            }

            if let Err(e) = persist(session, &job, live.is_some()).await {
                error!("Failed to persist recovered job {}: {}", job_id, e);
                notes.push(format!("could not write recovered record: {}", e));
                let result = RecoveryResult::new(job_id, RecoveryStatus::Failed, Some(method))
                    .with_notes(notes);
                return self.finish(&ctx, result).await;
            }
            self.validator.cache().set_baseline(&job.id, &hash).await;

            let mut result = RecoveryResult::new(job_id, repair.status, Some(method));
            result.validation_passed = validation.is_valid;
            result.recovered_data = Some(job);
            result.notes = notes;
            return self.finish(&ctx, result).await;
        }

        let result =
            RecoveryResult::new(job_id, RecoveryStatus::NotRecoverable, None).with_notes(notes);
        self.finish(&ctx, result).await
    }

    async fn restore_from_backup(
        &self,
        job_id: &str,
        live: Option<&JobRecord>,
        notes: &mut Vec<String>,
    ) -> Option<Repair> {
        let snapshot = match self.backups.latest(job_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                notes.push("no backup available".to_string());
                return None;
            }
            Err(e) => {
                notes.push(format!("backup unreadable: {}", e));
                return None;
            }
        };
        if !snapshot.verify() {
            notes.push("backup checksum mismatch, ignoring it".to_string());
            return None;
        }

        let job = match live {
            Some(live) => {
                let mut job = live.clone();
                snapshot.apply_to(&mut job);
                job
            }
            None => snapshot.to_record(),
        };
        Some(Repair {
            job,
            status: RecoveryStatus::Success,
            notes: vec![format!("restored from backup taken {}", snapshot.backed_up_at)],
        })
    }

    async fn partial_recovery(
        &self,
        session: &JobSession,
        live: Option<&JobRecord>,
        notes: &mut Vec<String>,
    ) -> Option<Repair> {
        let Some(live) = live else {
            notes.push("no live record to repair".to_string());
            return None;
        };
        let mut job = live.clone();
        let mut repairs = Vec::new();

        match resolve_ownership(session, &job).await {
            Ok(Ownership::Consistent) => {}
            Ok(Ownership::Derived { owner_id, connection_id, note }) => {
                job.owner_id = owner_id;
                job.connection_id = connection_id;
                repairs.push(note);
            }
            Ok(Ownership::Unresolvable(reason)) => {
                notes.push(format!("partial recovery not possible: {}", reason));
                return None;
            }
            Err(e) => {
                notes.push(format!("partial recovery lookup failed: {}", e));
                return None;
            }
        }

        repair_settings(&mut job, &self.validator.max_length_range(), &mut repairs);
        repair_timestamps(&mut job, &mut repairs);

        if repairs.is_empty() {
            repairs.push("no field-level damage found; integrity hash re-derived".to_string());
        }
        Some(Repair {
            job,
            status: RecoveryStatus::PartialSuccess,
            notes: repairs,
        })
    }

    async fn finish(&self, ctx: &AttemptContext, result: RecoveryResult) -> RecoveryResult {
        match result.status {
            RecoveryStatus::Success | RecoveryStatus::PartialSuccess => info!(
                "Recovered job {} via {:?} ({:?})",
                result.job_id, result.method_used, result.status
            ),
            _ => warn!(
                "Recovery of job {} ended {:?} via {:?}",
                result.job_id, result.status, result.method_used
            ),
        }
        self.audit
            .append(&RecoveryLogEntry::from_result(&result, &ctx.correlation_id))
            .await;
        result
    }
}

enum Ownership {
    Consistent,
    Derived {
        owner_id: i64,
        connection_id: i64,
        note: String,
    },
    Unresolvable(String),
}

/// Fill a missing owner or connection from the other side of the relation
async fn resolve_ownership(session: &JobSession, job: &JobRecord) -> StorageResult<Ownership> {
    let owner_ok = job.owner_id > 0;
    let connection_ok = job.connection_id > 0;

    Ok(match (owner_ok, connection_ok) {
        (true, true) => match session.connection_owner(job.connection_id).await? {
            Some(owner) if owner == job.owner_id => Ownership::Consistent,
            Some(owner) => Ownership::Unresolvable(format!(
                "connection {} belongs to owner {}, not {}",
                job.connection_id, owner, job.owner_id
            )),
            None => Ownership::Unresolvable(format!(
                "connection {} does not exist",
                job.connection_id
            )),
        },
        (false, true) => match session.connection_owner(job.connection_id).await? {
            Some(owner) => Ownership::Derived {
                owner_id: owner,
                connection_id: job.connection_id,
                note: format!(
                    "owner_id {} derived from connection {}",
                    owner, job.connection_id
                ),
            },
            None => Ownership::Unresolvable("owner missing and connection unknown".to_string()),
        },
        (true, false) => {
            let connections = session.connections_for_owner(job.owner_id).await?;
            match connections.as_slice() {
                [only] => Ownership::Derived {
                    owner_id: job.owner_id,
                    connection_id: *only,
                    note: format!(
                        "connection_id {} derived from owner {}",
                        only, job.owner_id
                    ),
                },
                [] => Ownership::Unresolvable(format!(
                    "owner {} has no connections",
                    job.owner_id
                )),
                _ => Ownership::Unresolvable(format!(
                    "owner {} has {} connections, cannot pick one",
                    job.owner_id,
                    connections.len()
                )),
            }
        }
        (false, false) => Ownership::Unresolvable("owner and connection both missing".to_string()),
    })
}

/// Substitute documented defaults for known settings that are missing,
/// malformed or outside what enqueue validation accepts
fn repair_settings(
    job: &mut JobRecord,
    max_length: &RangeInclusive<u32>,
    repairs: &mut Vec<String>,
) {
    let defaults = JobSettings::default().to_map();
    for (key, default) in &defaults {
        let problem = match job.settings.get(key) {
            None | Some(Value::Null) => Some("missing".to_string()),
            Some(value) if key == MAX_LENGTH_KEY => {
                match value.as_u64().and_then(|n| u32::try_from(n).ok()) {
                    Some(n) if max_length.contains(&n) => None,
                    Some(n) => Some(format!(
                        "{} outside {}..={}",
                        n,
                        max_length.start(),
                        max_length.end()
                    )),
                    None => Some(format!("{} is not a length", value)),
                }
            }
            Some(Value::String(code)) if key == LANGUAGE_KEY => {
                (!is_language_code(code)).then(|| format!("'{}' is not a language code", code))
            }
            Some(Value::String(_)) => None,
            Some(value) => Some(format!("{} has the wrong type", value)),
        };
        if let Some(problem) = problem {
            job.settings.insert(key.clone(), default.clone());
            repairs.push(format!("settings.{} {}, reset to default {}", key, problem, default));
        }
    }
}

fn repair_timestamps(job: &mut JobRecord, repairs: &mut Vec<String>) {
    let now = Utc::now();
    if job.status == JobStatus::Running && job.started_at.is_none() {
        job.started_at = Some(now);
        repairs.push("missing started_at set to recovery time".to_string());
    }
    if job.status.is_terminal() && job.completed_at.is_none() {
        job.completed_at = Some(now);
        repairs.push("missing completed_at set to recovery time".to_string());
    }
    if let Some(started) = job.started_at {
        if started < job.created_at {
            job.started_at = Some(job.created_at);
            repairs.push("started_at clamped to created_at".to_string());
        }
    }
    if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
        if completed < started {
            job.completed_at = Some(started);
            repairs.push("completed_at clamped to started_at".to_string());
        }
    }
}

/// Last resort: fail the job with default settings when its IDs are usable
fn reset_to_defaults(live: Option<&JobRecord>, notes: &mut Vec<String>) -> Option<Repair> {
    let live = live?;
    if live.owner_id <= 0 || live.connection_id <= 0 {
        notes.push("owner or connection unrecoverable, cannot reset".to_string());
        return None;
    }

    let now = Utc::now();
    let mut job = live.clone();
    job.settings = JobSettings::default().to_map();
    job.status = JobStatus::Failed;
    if job.started_at.is_none_or(|s| s < job.created_at) {
        job.started_at = Some(job.created_at);
    }
    job.completed_at = Some(now);
    job.error_message.push(ErrorRecord {
        occurred_at: now,
        error_type: "DataIntegrityViolation".to_string(),
        category: FaultCategory::TaskValidation,
        message: "record was corrupted beyond repair and reset to defaults".to_string(),
        attempt: job.retry_count,
        terminal: true,
    });
    Some(Repair {
        job,
        status: RecoveryStatus::Failed,
        notes: vec!["settings reset to defaults and job marked failed".to_string()],
    })
}

async fn persist(session: &JobSession, job: &JobRecord, exists: bool) -> StorageResult<()> {
    if exists {
        session.update(job).await
    } else {
        session.insert(job).await
    }
}
