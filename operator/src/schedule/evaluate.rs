//! Combines the base off-hour windows with an optional effective exception
//! into a single "should this plan be hibernating right now?" answer.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use hibernator_types::{ExceptionType, OffHourWindow, PlanSchedule};
use std::fmt;

use super::{cron, window};
use crate::util::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleState {
    Active,
    Hibernated,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleState::Active => write!(f, "active"),
            ScheduleState::Hibernated => write!(f, "hibernated"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleResult {
    pub should_hibernate: bool,
    pub next_hibernate: Option<DateTime<Utc>>,
    pub next_wake_up: Option<DateTime<Utc>>,
    pub state: ScheduleState,
    pub in_grace_period: bool,
}

/// The one exception currently in effect for a plan, projected out of the
/// `ScheduleException` resource by the reconciler.
#[derive(Clone, Debug)]
pub struct ActiveException {
    pub name: String,
    pub exception_type: ExceptionType,
    pub windows: Vec<OffHourWindow>,
    pub lead_time: Option<Duration>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Compiles the first off-hour window into a (hibernate, wake) cron pair.
/// Both expressions share the window's day set, including for overnight
/// windows.
// TODO: compile every window, not just the first
pub fn convert_off_hours_to_cron(windows: &[OffHourWindow]) -> Result<(String, String), Error> {
    let first = windows
        .first()
        .ok_or_else(|| Error::InvalidSchedule("schedule has no off-hour windows".into()))?;
    let (start_h, start_m) = window::parse_hhmm(&first.start)?;
    let (end_h, end_m) = window::parse_hhmm(&first.end)?;
    // Validate day names and start != end up front.
    window::parse_days(&first.days_of_week)?;
    window::window_minutes(first)?;
    let days = first.days_of_week.join(",");
    let hibernate = format!("{} {} * * {}", start_m, start_h, days);
    let wake = format!("{} {} * * {}", end_m, end_h, days);
    Ok((hibernate, wake))
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduleEvaluator {
    /// Grace buffer applied around window boundaries to dampen flapping.
    buffer: Duration,
}

impl Default for ScheduleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleEvaluator {
    pub fn new() -> Self {
        Self {
            buffer: Duration::zero(),
        }
    }

    pub fn with_buffer(buffer: Duration) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Evaluates the plan schedule at `now`, composing in the supplied
    /// exception when its validity interval contains `now`.
    pub fn evaluate(
        &self,
        schedule: &PlanSchedule,
        exception: Option<&ActiveException>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, Error> {
        let tz = window::parse_timezone(&schedule.timezone)?;
        let exception =
            exception.filter(|e| e.valid_from <= now && now <= e.valid_until);
        match exception {
            None => self.evaluate_windows(&schedule.off_hours, tz, now),
            Some(e) => match e.exception_type {
                ExceptionType::Extend => self.evaluate_extend(&schedule.off_hours, e, tz, now),
                ExceptionType::Suspend => self.evaluate_suspend(&schedule.off_hours, e, tz, now),
                ExceptionType::Replace => self.evaluate_windows(&e.windows, tz, now),
            },
        }
    }

    /// Base evaluation over a window list: the most recent boundary wins,
    /// with the grace buffer holding the hibernate decision across a
    /// just-passed boundary.
    fn evaluate_windows(
        &self,
        windows: &[OffHourWindow],
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, Error> {
        if windows.is_empty() {
            return Ok(ScheduleResult {
                should_hibernate: false,
                next_hibernate: None,
                next_wake_up: None,
                state: ScheduleState::Active,
                in_grace_period: false,
            });
        }

        let (hibernate_expr, wake_expr) = convert_off_hours_to_cron(windows)?;
        let hibernate = cron::parse_cron(&hibernate_expr)?;
        let wake = cron::parse_cron(&wake_expr)?;

        let last_hibernate = cron::find_last_occurrence(&hibernate, tz, now);
        let last_wake = cron::find_last_occurrence(&wake, tz, now);
        let mut should_hibernate = match (last_hibernate, last_wake) {
            (Some(h), Some(w)) => h > w,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let mut in_grace_period = false;
        if self.buffer > Duration::zero() && !should_hibernate {
            let local = now.with_timezone(&tz);
            let past_start =
                window::in_grace_window(window::GraceBoundary::Start, windows, local, self.buffer)?;
            let past_end = window::in_grace_window(
                window::GraceBoundary::End,
                windows,
                local,
                self.buffer,
            )? || window::in_late_window(windows, local, self.buffer)?;
            if past_start || past_end {
                // Either the shutdown boundary or the wake boundary just
                // passed; hold the hibernate decision for the buffer length.
                should_hibernate = true;
                in_grace_period = true;
            }
        }

        Ok(ScheduleResult {
            should_hibernate,
            next_hibernate: cron::next_occurrence(&hibernate, tz, now),
            next_wake_up: cron::next_occurrence(&wake, tz, now),
            state: if should_hibernate {
                ScheduleState::Hibernated
            } else {
                ScheduleState::Active
            },
            in_grace_period,
        })
    }

    /// Extend semantics: both schedules must agree before hibernating.
    /// Next event times take the earlier of the two schedules.
    fn evaluate_extend(
        &self,
        base_windows: &[OffHourWindow],
        exception: &ActiveException,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, Error> {
        let base = self.evaluate_windows(base_windows, tz, now)?;
        let exc = self.evaluate_windows(&exception.windows, tz, now)?;
        let should_hibernate = base.should_hibernate && exc.should_hibernate;
        Ok(ScheduleResult {
            should_hibernate,
            next_hibernate: earlier(base.next_hibernate, exc.next_hibernate),
            next_wake_up: earlier(base.next_wake_up, exc.next_wake_up),
            state: if should_hibernate {
                ScheduleState::Hibernated
            } else {
                ScheduleState::Active
            },
            in_grace_period: base.in_grace_period || exc.in_grace_period,
        })
    }

    /// Suspend semantics: the exception windows carve a hole out of the
    /// base schedule, and the lead-in before a suspension window keeps a
    /// hibernation from starting right before it.
    fn evaluate_suspend(
        &self,
        base_windows: &[OffHourWindow],
        exception: &ActiveException,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, Error> {
        let mut result = self.evaluate_windows(base_windows, tz, now)?;
        if exception.windows.is_empty() {
            return Ok(result);
        }
        let local = now.with_timezone(&tz);
        let suspended = window::in_time_windows(&exception.windows, local)?;
        let in_lead = match exception.lead_time {
            Some(lead) => window::in_lead_time_window(&exception.windows, local, lead)?,
            None => false,
        };
        if suspended || (in_lead && result.should_hibernate) {
            if suspended && result.should_hibernate {
                // The plan would be asleep right now; surface the end of the
                // suspension window as the next chance to hibernate.
                if let Ok((_, wake_expr)) = convert_off_hours_to_cron(&exception.windows)
                    && let Ok(wake) = cron::parse_cron(&wake_expr)
                {
                    result.next_hibernate = earlier(
                        cron::next_occurrence(&wake, tz, now),
                        result.next_hibernate,
                    );
                }
            }
            result.should_hibernate = false;
            result.state = ScheduleState::Active;
            result.in_grace_period = false;
        }
        Ok(result)
    }

    /// Delay until this plan next needs schedule-driven attention:
    /// time to the next relevant boundary plus the buffer and a safety pad,
    /// clamped to at least one minute.
    pub fn next_requeue_time(
        &self,
        result: &ScheduleResult,
        now: DateTime<Utc>,
    ) -> std::time::Duration {
        let target = if result.should_hibernate {
            result.next_wake_up
        } else {
            result.next_hibernate
        };
        let minimum = std::time::Duration::from_secs(60);
        let Some(target) = target else {
            return minimum;
        };
        let delay = target - now + self.buffer + Duration::seconds(10);
        match delay.to_std() {
            Ok(d) if d >= minimum => d,
            _ => minimum,
        }
    }
}

fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) => x,
        (None, y) => y,
    }
}
