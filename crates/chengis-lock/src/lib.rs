//! Approval gate state machine.
//!
//! `pending → approved | rejected | timed-out | cancelled`, each terminal
//! transition enforced by the single-winner conditional update
//! `chengis_store::Store::try_resolve_gate` provides, using the same
//! stale-timeout detection and single-owner semantics as the other
//! lock-holding paths in this workspace, generalized here to one lock
//! domain per gate.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chengis_environment::Clock;
use chengis_store::Store;
use chengis_types::{ApprovalConfig, ApprovalGate, Build, BuildId, GateId, GateStatus};

/// Known role ranks, lowest to highest. A caller's role rank must be at
/// least the gate's `required_role` rank to approve or reject it.
fn role_rank(role: &str) -> u8 {
    match role {
        "viewer" => 0,
        "developer" => 1,
        "lead" => 2,
        "release-manager" => 3,
        "admin" => 4,
        _ => 0,
    }
}

pub fn can_resolve(user_role: &str, required_role: &str) -> bool {
    role_rank(user_role) >= role_rank(required_role)
}

/// Create a `pending` gate for a stage's approval config and persist it.
pub fn create_gate(store: &dyn Store, build_id: &BuildId, stage_name: &str, approval: &ApprovalConfig, clock: &dyn Clock) -> Result<ApprovalGate> {
    let gate = ApprovalGate {
        id: GateId::generate(),
        build_id: build_id.clone(),
        stage_name: stage_name.to_string(),
        status: GateStatus::Pending,
        required_role: approval.role.clone(),
        message: approval.message.clone(),
        timeout_minutes: approval.timeout_minutes,
        approved_by: None,
        approved_at: None,
        rejected_by: None,
        rejected_at: None,
        created_at: clock.now(),
    };
    store.upsert_gate(&gate)?;
    Ok(gate)
}

/// `approve(gate, user)`: role check happens before the attempt; callers
/// with insufficient rank never reach the conditional update. Returns
/// `true` iff this call was the single winner.
pub fn approve(store: &dyn Store, gate: &ApprovalGate, user: &str, user_role: &str, clock: &dyn Clock) -> Result<bool> {
    if !can_resolve(user_role, &gate.required_role) {
        return Err(anyhow!("role {user_role} cannot approve a gate requiring {}", gate.required_role));
    }
    let now = clock.now();
    let user = user.to_string();
    store.try_resolve_gate(&gate.id, &move |g: &ApprovalGate| {
        let mut g = g.clone();
        g.status = GateStatus::Approved;
        g.approved_by = Some(user.clone());
        g.approved_at = Some(now);
        g
    })
}

/// `reject(gate, user)`: symmetric to `approve`.
pub fn reject(store: &dyn Store, gate: &ApprovalGate, user: &str, user_role: &str, clock: &dyn Clock) -> Result<bool> {
    if !can_resolve(user_role, &gate.required_role) {
        return Err(anyhow!("role {user_role} cannot reject a gate requiring {}", gate.required_role));
    }
    let now = clock.now();
    let user = user.to_string();
    store.try_resolve_gate(&gate.id, &move |g: &ApprovalGate| {
        let mut g = g.clone();
        g.status = GateStatus::Rejected;
        g.rejected_by = Some(user.clone());
        g.rejected_at = Some(now);
        g
    })
}

/// Outcome of waiting on a gate to resolve, as observed by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateWaitOutcome {
    Approved,
    Rejected { reason: String },
    TimedOut,
    Cancelled,
}

impl GateWaitOutcome {
    pub fn proceed(&self) -> bool {
        matches!(self, GateWaitOutcome::Approved)
    }
}

/// Poll the gate until it resolves, times out, or the build is cancelled.
/// Cancellation resolves the *wait*, not the gate: the row is left
/// `pending` in the store, matching the scenario where a cancelled build
/// never auto-rejects an outstanding approval.
pub fn wait_for_resolution(
    store: &dyn Store,
    gate_id: &GateId,
    poll_interval: Duration,
    clock: &dyn Clock,
    mut is_cancelled: impl FnMut() -> bool,
) -> Result<GateWaitOutcome> {
    loop {
        let gate = store.get_gate(gate_id)?.ok_or_else(|| anyhow!("gate {gate_id} not found"))?;
        match gate.status {
            GateStatus::Approved => return Ok(GateWaitOutcome::Approved),
            GateStatus::Rejected => {
                return Ok(GateWaitOutcome::Rejected { reason: format!("rejected by {}", gate.rejected_by.unwrap_or_default()) });
            }
            GateStatus::TimedOut => return Ok(GateWaitOutcome::TimedOut),
            GateStatus::Cancelled => return Ok(GateWaitOutcome::Cancelled),
            GateStatus::Pending => {}
        }

        if is_cancelled() {
            return Ok(GateWaitOutcome::Cancelled);
        }

        let elapsed = clock.now().signed_duration_since(gate.created_at);
        if elapsed.num_minutes() >= gate.timeout_minutes as i64 {
            let _ = store.try_resolve_gate(gate_id, &|g: &ApprovalGate| {
                let mut g = g.clone();
                g.status = GateStatus::TimedOut;
                g
            });
            return Ok(GateWaitOutcome::TimedOut);
        }

        thread::sleep(poll_interval);
    }
}

/// Resolve `required_role`/`min_approvals`/`approver_group` overrides the
/// policy engine layered onto a stage's approval config (§4.L
/// `required-approval`): max-of for `min_approvals`, union for the
/// approver group.
pub fn merge_approval_override(base: &mut ApprovalConfig, min_approvals: u32, approver_group: &[String]) {
    base.min_approvals = base.min_approvals.max(min_approvals);
    for approver in approver_group {
        if !base.approver_group.contains(approver) {
            base.approver_group.push(approver.clone());
        }
    }
}

/// Whether a build has finished without going through an approval gate at
/// all is irrelevant to this module; it only reasons over already-created
/// gates. Kept for callers that need a quick existence check before
/// deciding whether to poll.
pub fn has_pending_gate(store: &dyn Store, build: &Build, stage_name: &str) -> Result<bool> {
    Ok(store.get_gate_for_stage(&build.id, stage_name)?.is_some_and(|g| g.status == GateStatus::Pending))
}
