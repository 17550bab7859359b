//! Tamper-detection hash over a job's critical fields

use serde_json::json;
use sha2::{Digest, Sha256};

use super::JobRecord;

/// Outcome of comparing a job's stored hash with a freshly derived one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityCheck {
    Match,
    Mismatch { expected: String, actual: String },
    Missing,
}

/// SHA-256 over the canonical subset {id, owner, connection, settings, priority}
///
/// serde_json maps are key-sorted, so the serialization is canonical.
pub fn compute_integrity_hash(job: &JobRecord) -> String {
    let canonical = json!({
        "id": job.id,
        "owner_id": job.owner_id,
        "connection_id": job.connection_id,
        "settings": job.settings,
        "priority": job.priority,
    });
    sha256_hex(canonical.to_string().as_bytes())
}

/// Compare `job.integrity_hash` (or `baseline` when the record carries none)
/// with the hash derived from the current field values
pub fn verify_integrity(job: &JobRecord, baseline: Option<&str>) -> IntegrityCheck {
    let expected = match job.integrity_hash.as_deref().or(baseline) {
        Some(hash) => hash,
        None => return IntegrityCheck::Missing,
    };
    let actual = compute_integrity_hash(job);
    if actual == expected {
        IntegrityCheck::Match
    } else {
        IntegrityCheck::Mismatch {
            expected: expected.to_string(),
            actual,
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
