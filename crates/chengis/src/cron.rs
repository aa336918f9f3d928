//! Cron schedule parsing and due-schedule processing (§4.O).
//!
//! Schedules are persisted [`CronSchedule`] rows (`chengis-store`'s cron
//! methods); this module owns the 5-field POSIX expression grammar
//! (`minute hour day-of-month month day-of-week`, each field `*`, `*/N`,
//! `A-B`, or `A,B`) and the tick loop that advances `next_run_at` and
//! records what happened.

use anyhow::{Result, bail};
use chengis_environment::Clock;
use chengis_store::Store;
use chengis_types::{CronSchedule, ScheduleRunOutcome};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

/// Ceiling on how many minutes `next_run_time` will advance looking for a
/// match before giving up — guards a malformed expression (e.g. a
/// day-of-month that never falls on an allowed day-of-week) from spinning
/// forever. Four years of minutes comfortably covers any legal cron field.
const MAX_ADVANCE_MINUTES: i64 = 60 * 24 * 366 * 4;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Range(u32, u32),
    List(Vec<u32>),
}

impl Field {
    fn parse(raw: &str) -> Result<Self> {
        if raw == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let n: u32 = step.parse().map_err(|_| anyhow::anyhow!("invalid step field: {raw}"))?;
            if n == 0 {
                bail!("step of 0 in cron field: {raw}");
            }
            return Ok(Field::Step(n));
        }
        if let Some((lo, hi)) = raw.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| anyhow::anyhow!("invalid range field: {raw}"))?;
            let hi: u32 = hi.parse().map_err(|_| anyhow::anyhow!("invalid range field: {raw}"))?;
            return Ok(Field::Range(lo, hi));
        }
        if raw.contains(',') {
            let values: Result<Vec<u32>> = raw.split(',').map(|v| v.parse::<u32>().map_err(|_| anyhow::anyhow!("invalid list field: {raw}"))).collect();
            return Ok(Field::List(values?));
        }
        let value: u32 = raw.parse().map_err(|_| anyhow::anyhow!("invalid cron field: {raw}"))?;
        Ok(Field::List(vec![value]))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => value % n == 0,
            Field::Range(lo, hi) => value >= *lo && value <= *hi,
            Field::List(values) => values.contains(&value),
        }
    }
}

/// A parsed 5-field POSIX cron expression.
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression must have 5 fields, got {}: {expression}", fields.len());
        }
        Ok(CronExpr {
            minute: Field::parse(fields[0])?,
            hour: Field::parse(fields[1])?,
            day_of_month: Field::parse(fields[2])?,
            month: Field::parse(fields[3])?,
            day_of_week: Field::parse(fields[4])?,
        })
    }

    fn matches(&self, at: &DateTime<chrono_tz::Tz>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }
}

/// True iff `expression` matches the minute containing `at` (evaluated in
/// `timezone`, falling back to UTC for an unknown zone name).
pub fn cron_matches(expression: &str, timezone: &str, at: DateTime<Utc>) -> Result<bool> {
    let expr = CronExpr::parse(expression)?;
    let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    Ok(expr.matches(&at.with_timezone(&tz)))
}

/// The next minute-boundary at or after `after` (exclusive) that
/// `expression` matches, in `timezone`. Advances minute-by-minute up to
/// [`MAX_ADVANCE_MINUTES`] before giving up.
pub fn next_run_time(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = CronExpr::parse(expression)?;
    let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    let mut candidate = after + ChronoDuration::minutes(1);
    candidate = Utc
        .with_ymd_and_hms(candidate.year(), candidate.month(), candidate.day(), candidate.hour(), candidate.minute(), 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("ambiguous local time while advancing cron clock"))?;

    for _ in 0..MAX_ADVANCE_MINUTES {
        let local = candidate.with_timezone(&tz);
        if expr.matches(&local) {
            return Ok(candidate);
        }
        candidate += ChronoDuration::minutes(1);
    }
    bail!("no matching run time found for `{expression}` within the advance ceiling");
}

/// Tick every enabled schedule whose `next_run_at` has passed: trigger a
/// build request for each (the caller supplies `on_trigger`, since this
/// module doesn't own `pipeline::run_build`'s full `ExecutionContext`),
/// advance `next_run_at`, and record the outcome to the audit trail.
/// Returns the outcome recorded for each schedule ticked this pass.
///
/// `ScheduleRunOutcome::Disabled` never comes from this function —
/// `Store::list_enabled_cron_schedules` only ever returns enabled rows —
/// but remains a variant a caller doing its own disabled-schedule
/// bookkeeping (e.g. an admin-facing schedule list) can still record.
pub fn process_due_schedules(
    store: &dyn Store,
    clock: &dyn Clock,
    missed_run_threshold_minutes: i64,
    mut on_trigger: impl FnMut(&CronSchedule) -> Result<()>,
) -> Result<Vec<(CronSchedule, ScheduleRunOutcome)>> {
    let now = clock.now();
    let mut results = Vec::new();
    for mut schedule in store.list_enabled_cron_schedules()? {
        if schedule.next_run_at > now {
            continue;
        }

        let overdue_minutes = (now - schedule.next_run_at).num_minutes();
        let outcome = if overdue_minutes > missed_run_threshold_minutes {
            ScheduleRunOutcome::Missed
        } else {
            match on_trigger(&schedule) {
                Ok(()) => ScheduleRunOutcome::Triggered,
                Err(_) => ScheduleRunOutcome::Missed,
            }
        };

        schedule.last_run_at = Some(now);
        schedule.next_run_at = next_run_time(&schedule.expression, &schedule.timezone, now)?;
        store.upsert_cron_schedule(&schedule)?;

        crate::compliance::append_audit_entry(
            store,
            clock,
            &schedule.org_id,
            "system",
            "cron-scheduler",
            "cron-tick",
            "cron-schedule",
            schedule.id.as_str(),
            serde_json::json!({ "outcome": outcome, "expression": schedule.expression }),
            None,
        )?;

        results.push((schedule, outcome));
    }
    Ok(results)
}
