//! Audit hash-chain verification and compliance readiness scoring (§4.T).
//!
//! Every [`AuditLog`] row carries `prev_hash`/`hash`: `hash` covers the
//! row's own fields plus the previous row's hash, so tampering with or
//! deleting a row breaks the chain for every row after it. Hashing reuses
//! [`crate::ids::canonical_json`] (open question: whether audit hashing and
//! stage fingerprinting should share a canonicalization rule — decided yes,
//! a second hand-rolled canonicalizer would drift from the first silently).

use anyhow::Result;
use chengis_environment::Clock;
use chengis_store::Store;
use chengis_types::{AuditId, AuditLog, CheckStatus, ReadinessCheck, ReadinessReport};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::ids::canonical_json;

#[derive(Serialize)]
struct AuditHashFields<'a> {
    user_id: &'a str,
    username: &'a str,
    action: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    detail: &'a serde_json::Value,
    ip_address: &'a Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
    prev_hash: &'a str,
}

fn compute_hash(entry: &AuditLog) -> String {
    let fields = AuditHashFields {
        user_id: &entry.user_id,
        username: &entry.username,
        action: &entry.action,
        resource_type: &entry.resource_type,
        resource_id: &entry.resource_id,
        detail: &entry.detail,
        ip_address: &entry.ip_address,
        timestamp: entry.timestamp,
        prev_hash: &entry.prev_hash,
    };
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&fields));
    hex::encode(hasher.finalize())
}

/// Append a new audit entry, chaining it to `org_id`'s last entry. This is
/// the only way an audit row should ever be constructed: computing `hash`
/// by hand anywhere else risks drifting from this function's field order.
#[allow(clippy::too_many_arguments)]
pub fn append_audit_entry(
    store: &dyn Store,
    clock: &dyn Clock,
    org_id: &str,
    user_id: &str,
    username: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    detail: serde_json::Value,
    ip_address: Option<String>,
) -> Result<AuditLog> {
    let prev_hash = store.last_audit(org_id)?.map(|e| e.hash).unwrap_or_default();
    let mut entry = AuditLog {
        id: AuditId::generate(),
        user_id: user_id.to_string(),
        username: username.to_string(),
        action: action.to_string(),
        resource_type: resource_type.to_string(),
        resource_id: resource_id.to_string(),
        detail,
        ip_address,
        timestamp: clock.now(),
        prev_hash,
        hash: String::new(),
    };
    entry.hash = compute_hash(&entry);
    store.append_audit(&entry)?;
    Ok(entry)
}

/// The first entry whose `prev_hash` doesn't match its predecessor's
/// `hash`, or whose own `hash` doesn't match its recomputed value —
/// whichever comes first in chain order. `entries` must already be in
/// chain order (oldest first), as returned by `Store::list_audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBreak {
    pub index: usize,
}

pub fn verify_audit_chain(entries: &[AuditLog]) -> Option<ChainBreak> {
    let mut expected_prev = String::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.prev_hash != expected_prev {
            return Some(ChainBreak { index });
        }
        if compute_hash(entry) != entry.hash {
            return Some(ChainBreak { index });
        }
        expected_prev = entry.hash.clone();
    }
    None
}

/// Score a set of named checks as `passing / total * 100`, rounded to two
/// decimal places. `NotAssessed` checks count toward the denominator but
/// not the numerator — an unassessed control is not a passing one.
pub fn assess_readiness(framework: &str, checks: Vec<(&str, CheckStatus)>) -> ReadinessReport {
    let total = checks.len();
    let passing = checks.iter().filter(|(_, status)| *status == CheckStatus::Passing).count();
    let score = if total == 0 { 0.0 } else { (passing as f64 / total as f64 * 100.0 * 100.0).round() / 100.0 };
    ReadinessReport {
        framework: framework.to_string(),
        checks: checks.into_iter().map(|(name, status)| ReadinessCheck { name: name.to_string(), status }).collect(),
        score,
    }
}
