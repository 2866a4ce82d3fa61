//! Next-run computation for all schedule kinds

use chrono::DateTime;
use cron::Schedule;

use super::types::CronSchedule;
use crate::{Error, Result};

/// Parse a cron expression, accepting the common 5-field form
///
/// The `cron` crate wants seconds first and an optional year; a 5-field
/// expression gets `0` seconds and `*` year added.
///
/// # Errors
///
/// Returns [`Error::Cron`] if the expression is invalid in both forms
pub fn parse_expr(expr: &str) -> Result<Schedule> {
    expr.parse::<Schedule>()
        .or_else(|_| format!("0 {expr} *").parse::<Schedule>())
        .map_err(|e| Error::Cron(format!("invalid cron expression '{expr}': {e}")))
}

/// Check a schedule without computing anything
///
/// # Errors
///
/// Returns [`Error::Cron`] for a zero interval or an invalid expression
pub fn validate(schedule: &CronSchedule) -> Result<()> {
    match schedule {
        CronSchedule::At { .. } => Ok(()),
        CronSchedule::Every { every_ms, .. } => {
            if *every_ms == 0 {
                Err(Error::Cron("every_ms must be > 0".to_string()))
            } else {
                Ok(())
            }
        }
        CronSchedule::Cron { expr } => parse_expr(expr).map(drop),
    }
}

/// Compute the next run time (epoch millis) strictly after `now_ms`
///
/// Returns `None` if the schedule has no future runs (a past one-shot).
///
/// # Errors
///
/// Returns [`Error::Cron`] if the schedule is invalid
pub fn compute_next_run(schedule: &CronSchedule, now_ms: u64) -> Result<Option<u64>> {
    match schedule {
        CronSchedule::At { at_ms } => Ok((*at_ms > now_ms).then_some(*at_ms)),
        CronSchedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms == 0 {
                return Err(Error::Cron("every_ms must be > 0".to_string()));
            }
            let anchor = anchor_ms.unwrap_or(now_ms);
            if anchor > now_ms {
                return Ok(Some(anchor));
            }
            let intervals = (now_ms - anchor) / every_ms;
            (intervals + 1)
                .checked_mul(*every_ms)
                .and_then(|offset| anchor.checked_add(offset))
                .map(Some)
                .ok_or_else(|| Error::Cron(format!("interval out of range: {every_ms}ms")))
        }
        CronSchedule::Cron { expr } => {
            let schedule = parse_expr(expr)?;
            let now_ms = i64::try_from(now_ms)
                .map_err(|_| Error::Cron(format!("timestamp out of range: {now_ms}")))?;
            let now = DateTime::from_timestamp_millis(now_ms)
                .ok_or_else(|| Error::Cron(format!("timestamp out of range: {now_ms}")))?;
            Ok(schedule
                .after(&now)
                .next()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok()))
        }
    }
}

/// Current time in epoch millis
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
