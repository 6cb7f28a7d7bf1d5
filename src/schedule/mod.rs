//! Cron-window evaluation for enabled periods
//!
//! A GovernedService may restrict scale-to-zero to a recurring window defined
//! by a 5-field cron expression (UTC) and a duration. The window is open at
//! time `t` iff some firing time `f` of the schedule satisfies
//! `f <= t < f + duration`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;

use crate::{Error, Result};

/// Lookback beyond the window length when scanning for the most recent
/// firing, so windows that started well in the past are still found
const SCAN_SLACK_HOURS: i64 = 24;

/// Parse and validate a 5-field cron expression (minute hour dom month dow)
pub fn parse_cron_schedule(schedule: &str) -> Result<Cron> {
    if schedule.trim().is_empty() {
        return Err(Error::schedule("cron schedule cannot be empty"));
    }
    let fields = schedule.split_whitespace().count();
    if fields != 5 {
        return Err(Error::schedule(format!(
            "cron expression {schedule:?} must have 5 fields, got {fields}"
        )));
    }
    Cron::new(schedule)
        .parse()
        .map_err(|e| Error::schedule(format!("invalid cron expression {schedule:?}: {e}")))
}

/// Parse and validate a duration string such as `30m` or `8h`
pub fn validate_duration(duration: &str) -> Result<Duration> {
    if duration.trim().is_empty() {
        return Err(Error::schedule("duration cannot be empty"));
    }
    let parsed = humantime::parse_duration(duration)
        .map_err(|e| Error::schedule(format!("invalid duration {duration:?}: {e}")))?;
    if parsed.is_zero() {
        return Err(Error::schedule(format!(
            "duration must be positive, got {duration:?}"
        )));
    }
    Ok(parsed)
}

/// Whether the current time falls inside the enabled window
pub fn is_in_enabled_period(schedule: &str, duration: Duration) -> Result<bool> {
    is_in_enabled_period_at(schedule, duration, Utc::now())
}

/// Whether the given time falls inside the enabled window. Time-injectable
/// for testing.
pub fn is_in_enabled_period_at(
    schedule: &str,
    duration: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let cron = parse_cron_schedule(schedule)?;
    let window = chrono::Duration::from_std(duration)
        .map_err(|e| Error::schedule(format!("duration out of range: {e}")))?;
    let slack = chrono::Duration::hours(SCAN_SLACK_HOURS);

    let Some(last_firing) = find_last_firing(&cron, now, window + slack) else {
        return Ok(false);
    };

    Ok(now < last_firing + window)
}

/// Most recent firing time `f <= now`, scanning forward from
/// `now - lookback`. Returns `None` when the schedule never fired inside the
/// lookback window.
fn find_last_firing(
    cron: &Cron,
    now: DateTime<Utc>,
    lookback: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let mut cursor = now - lookback;
    let mut last = None;

    while let Ok(next) = cron.find_next_occurrence(&cursor, false) {
        if next > now {
            break;
        }
        last = Some(next);
        cursor = next;
    }

    last
}
