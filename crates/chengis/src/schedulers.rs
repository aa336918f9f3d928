//! Retention, lock-rotation, and analytics background loops (§4.P).
//!
//! Each loop follows the same shape as [`crate::pipeline::run_build`]'s
//! cancellation handling: a shared `AtomicBool` the caller flips to stop
//! the loop between ticks, never mid-tick. No loop spins — every
//! iteration sleeps for its configured interval (§5: "No operation
//! spins").

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chengis_store::{Reporter, Store};
use chengis_types::{Build, BuildId, IacLock};

/// Builds eligible for retention: terminal builds whose `created_at` is
/// older than `max_age`. Deletion is storage-specific and intentionally
/// not this module's job — it only identifies candidates, the same
/// split other caching layers in this workspace draw between "what's
/// stale" and "how to evict it".
pub fn retention_candidates(builds: &[Build], now: chrono::DateTime<chrono::Utc>, max_age: chrono::Duration) -> Vec<BuildId> {
    builds
        .iter()
        .filter(|b| b.status.is_terminal() && now - b.created_at > max_age)
        .map(|b| b.id.clone())
        .collect()
}

/// Run one retention tick across every job in `org_id`: collect every
/// build via `list_builds_for_job` and return the ids eligible for purge
/// under `max_age`.
pub fn retention_tick(store: &dyn Store, org_id: &str, now: chrono::DateTime<chrono::Utc>, max_age: chrono::Duration) -> Result<Vec<BuildId>> {
    let mut candidates = Vec::new();
    for job in store.list_jobs(org_id)? {
        let builds = store.list_builds_for_job(&job.id)?;
        candidates.extend(retention_candidates(&builds, now, max_age));
    }
    Ok(candidates)
}

/// IaC project locks held past `stale_after`, force-unlocked on the
/// caller's behalf: a lock older than its timeout is treated as
/// abandoned, not indefinitely held by a dead owner.
pub fn rotate_stale_locks(store: &dyn Store, locks: &[IacLock], now: chrono::DateTime<chrono::Utc>, stale_after: chrono::Duration) -> Result<Vec<String>> {
    let mut released = Vec::new();
    for lock in locks {
        if now - lock.locked_at > stale_after && store.force_unlock_iac(&lock.project_id)? {
            released.push(lock.project_id.clone());
        }
    }
    Ok(released)
}

/// Aggregate build-outcome analytics across a set of builds: success
/// rate and mean wall-clock duration among builds that recorded both a
/// start and a completion time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildAnalytics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub mean_duration_ms: Option<i64>,
}

pub fn analyze_builds(builds: &[Build]) -> BuildAnalytics {
    let total = builds.len();
    let succeeded = builds.iter().filter(|b| b.status == chengis_types::BuildStatus::Success).count();
    let failed = builds.iter().filter(|b| b.status == chengis_types::BuildStatus::Failure).count();
    let success_rate = if total == 0 { 0.0 } else { (succeeded as f64 / total as f64 * 10000.0).round() / 100.0 };

    let durations: Vec<i64> = builds
        .iter()
        .filter_map(|b| match (b.started_at, b.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        })
        .collect();
    let mean_duration_ms = if durations.is_empty() { None } else { Some(durations.iter().sum::<i64>() / durations.len() as i64) };

    BuildAnalytics { total, succeeded, failed, success_rate, mean_duration_ms }
}

/// Run one analytics tick across every job in `org_id`.
pub fn analytics_tick(store: &dyn Store, org_id: &str) -> Result<BuildAnalytics> {
    let mut all_builds = Vec::new();
    for job in store.list_jobs(org_id)? {
        all_builds.extend(store.list_builds_for_job(&job.id)?);
    }
    Ok(analyze_builds(&all_builds))
}

/// Runs `tick` every `interval` until `cancelled` is set, checking the
/// flag both before sleeping and after waking so a stop request is
/// honored within one interval either way. A tick error is reported and
/// swallowed — one bad tick must not kill the loop.
pub fn run_loop(interval: Duration, cancelled: &AtomicBool, reporter: &mut dyn Reporter, mut tick: impl FnMut() -> Result<()>) {
    while !cancelled.load(Ordering::SeqCst) {
        if let Err(err) = tick() {
            reporter.warn(&format!("scheduler tick failed: {err:#}"));
        }
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(interval);
    }
}
