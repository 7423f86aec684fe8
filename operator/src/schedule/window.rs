//! Pure wall-clock window arithmetic. All predicates take an explicit
//! instant already converted into the plan's timezone; nothing in this
//! module reads the system clock.

use chrono::{DateTime, Datelike, Duration, Timelike, Weekday};
use chrono_tz::Tz;
use hibernator_types::OffHourWindow;

use crate::util::Error;

pub const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraceBoundary {
    Start,
    End,
}

pub fn parse_timezone(tz: &str) -> Result<Tz, Error> {
    tz.parse::<Tz>()
        .map_err(|_| Error::InvalidSchedule(format!("unknown timezone {:?}", tz)))
}

/// Parses "HH:MM" (24h).
pub fn parse_hhmm(value: &str) -> Result<(u32, u32), Error> {
    let invalid = || Error::InvalidSchedule(format!("invalid time {:?}, expected HH:MM", value));
    let (h, m) = value.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

pub fn parse_weekday(day: &str) -> Result<Weekday, Error> {
    match day {
        "SUN" => Ok(Weekday::Sun),
        "MON" => Ok(Weekday::Mon),
        "TUE" => Ok(Weekday::Tue),
        "WED" => Ok(Weekday::Wed),
        "THU" => Ok(Weekday::Thu),
        "FRI" => Ok(Weekday::Fri),
        "SAT" => Ok(Weekday::Sat),
        _ => Err(Error::InvalidSchedule(format!(
            "unknown day {:?}, expected SUN..SAT",
            day
        ))),
    }
}

pub fn parse_days(days: &[String]) -> Result<Vec<Weekday>, Error> {
    if days.is_empty() {
        return Err(Error::InvalidSchedule("window has no days of week".into()));
    }
    days.iter().map(|d| parse_weekday(d)).collect()
}

fn minute_of(value: &str) -> Result<i64, Error> {
    let (h, m) = parse_hhmm(value)?;
    Ok(i64::from(h) * 60 + i64::from(m))
}

/// Start and end minute-of-day; rejects `start == end`.
pub fn window_minutes(window: &OffHourWindow) -> Result<(i64, i64), Error> {
    let start = minute_of(&window.start)?;
    let end = minute_of(&window.end)?;
    if start == end {
        return Err(Error::InvalidSchedule(format!(
            "window start {:?} equals end {:?}",
            window.start, window.end
        )));
    }
    Ok((start, end))
}

/// A window is overnight when it crosses midnight.
pub fn is_overnight(start: i64, end: i64) -> bool {
    end <= start
}

fn minute_of_day<T: Timelike>(now: &T) -> i64 {
    i64::from(now.hour()) * 60 + i64::from(now.minute())
}

/// True iff `now` falls inside some window. For overnight windows the
/// evening leg matches on a listed day and the morning leg matches on the
/// day after a listed day.
pub fn in_time_windows(windows: &[OffHourWindow], now: DateTime<Tz>) -> Result<bool, Error> {
    let t = minute_of_day(&now);
    for window in windows {
        let (start, end) = window_minutes(window)?;
        let days = parse_days(&window.days_of_week)?;
        if !is_overnight(start, end) {
            if days.contains(&now.weekday()) && t >= start && t < end {
                return Ok(true);
            }
        } else {
            if days.contains(&now.weekday()) && t >= start {
                return Ok(true);
            }
            if days.contains(&now.weekday().pred()) && t < end {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// True iff `now` lies in `[start - lead, start)` of some window on a
/// matching day. A lead period that wraps below midnight is checked against
/// the *next* day's day set during the evening hours.
pub fn in_lead_time_window(
    windows: &[OffHourWindow],
    now: DateTime<Tz>,
    lead: Duration,
) -> Result<bool, Error> {
    let lead_minutes = lead.num_minutes();
    if lead_minutes <= 0 {
        return Ok(false);
    }
    let t = minute_of_day(&now);
    for window in windows {
        let (start, _) = window_minutes(window)?;
        let days = parse_days(&window.days_of_week)?;
        let lead_start = start - lead_minutes;
        if lead_start >= 0 {
            if days.contains(&now.weekday()) && t >= lead_start && t < start {
                return Ok(true);
            }
        } else {
            // Lead-in wraps into the previous day. The morning part still
            // belongs to the window's own day; the evening part belongs to
            // the day before it.
            if days.contains(&now.weekday()) && t < start {
                return Ok(true);
            }
            let wrapped = MINUTES_PER_DAY + lead_start;
            if now.hour() > 12 && days.contains(&now.weekday().succ()) && t >= wrapped {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// True iff `now` lies within `grace` after the given boundary, anchored on
/// the most recent occurrence of a matching weekday. End-grace stays on the
/// boundary's own weekday; start-grace may cross midnight.
pub fn in_grace_window(
    boundary: GraceBoundary,
    windows: &[OffHourWindow],
    now: DateTime<Tz>,
    grace: Duration,
) -> Result<bool, Error> {
    let grace_minutes = grace.num_minutes();
    if grace_minutes <= 0 {
        return Ok(false);
    }
    let t = minute_of_day(&now);
    for window in windows {
        let (start, end) = window_minutes(window)?;
        let days = parse_days(&window.days_of_week)?;
        match boundary {
            GraceBoundary::Start => {
                if days.contains(&now.weekday()) && t >= start && t - start <= grace_minutes {
                    return Ok(true);
                }
                // Grace interval spilled past midnight into the next day.
                if start + grace_minutes >= MINUTES_PER_DAY
                    && days.contains(&now.weekday().pred())
                    && t + MINUTES_PER_DAY - start <= grace_minutes
                {
                    return Ok(true);
                }
            }
            GraceBoundary::End => {
                // The end boundary of an overnight window lands on the day
                // after a listed day.
                let boundary_matches = if is_overnight(start, end) {
                    days.contains(&now.weekday().pred())
                } else {
                    days.contains(&now.weekday())
                };
                if boundary_matches && t >= end && t - end <= grace_minutes {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// End-grace variant without the same-weekday clamp: also matches the part
/// of `[end, end + grace]` that spills past midnight.
pub fn in_late_window(
    windows: &[OffHourWindow],
    now: DateTime<Tz>,
    grace: Duration,
) -> Result<bool, Error> {
    if in_grace_window(GraceBoundary::End, windows, now, grace)? {
        return Ok(true);
    }
    let grace_minutes = grace.num_minutes();
    if grace_minutes <= 0 {
        return Ok(false);
    }
    let t = minute_of_day(&now);
    for window in windows {
        let (start, end) = window_minutes(window)?;
        let days = parse_days(&window.days_of_week)?;
        if end + grace_minutes < MINUTES_PER_DAY {
            continue;
        }
        let day_of_end = if is_overnight(start, end) {
            // end lands on the day after a listed day; the spill is one more.
            now.weekday().pred().pred()
        } else {
            now.weekday().pred()
        };
        if days.contains(&day_of_end) && t + MINUTES_PER_DAY - end <= grace_minutes {
            return Ok(true);
        }
    }
    Ok(false)
}
