//! Thin wrapper around the `cron` crate. Plans speak 5-field cron
//! (minute hour dom month dow); the crate wants a seconds column, so
//! expressions are widened before parsing.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::util::Error;

/// Parses a standard 5-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, Error> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(Error::InvalidSchedule(format!(
            "cron expression {:?} has {} fields, expected 5",
            expr, fields
        )));
    }
    Ok(Schedule::from_str(&format!("0 {}", expr.trim()))?)
}

/// First fire time strictly after `now`, evaluated in `tz`.
pub fn next_occurrence(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Most recent fire time at or before `now`: walk forward from `now - 24h`
/// until the next result would exceed `now`. Falls back to a 7-day window
/// for schedules that fire less than daily.
pub fn find_last_occurrence(
    schedule: &Schedule,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    for lookback in [Duration::hours(24), Duration::days(7)] {
        let from = (now - lookback).with_timezone(&tz);
        let mut last = None;
        for t in schedule.after(&from) {
            let t = t.with_timezone(&Utc);
            if t > now {
                break;
            }
            last = Some(t);
        }
        if last.is_some() {
            return last;
        }
    }
    None
}
