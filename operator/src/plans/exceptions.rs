//! Projection and selection of `ScheduleException` side-objects for one
//! plan: the compact status list the plan carries, and the single exception
//! the evaluator composes in.

use chrono::{DateTime, Utc};
use hibernator_common::labels;
use hibernator_types::{ExceptionReference, ExceptionState, ScheduleException};
use kube::{Api, Client, ResourceExt, api::ListParams};

use crate::schedule::evaluate::ActiveException;
use crate::util::Error;
use crate::util::patch::time;

/// The plan status keeps at most this many exception references.
pub const EXCEPTION_REFERENCE_LIMIT: usize = 10;

pub async fn list_plan_exceptions(
    client: Client,
    namespace: &str,
    plan: &str,
) -> Result<Vec<ScheduleException>, Error> {
    let api: Api<ScheduleException> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("{}={}", labels::PLAN, plan));
    Ok(api.list(&params).await?.items)
}

fn reference_of(exception: &ScheduleException) -> ExceptionReference {
    let status = exception.status.clone().unwrap_or_default();
    ExceptionReference {
        name: exception.name_any(),
        exception_type: exception.spec.exception_type,
        state: status.state,
        valid_from: Some(exception.spec.valid_from.clone()),
        valid_until: Some(exception.spec.valid_until.clone()),
        expired_at: status.expired_at,
    }
}

fn state_of(exception: &ScheduleException) -> ExceptionState {
    exception
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default()
}

/// Compacts the known exceptions into the status list: everything not yet
/// expired first, then the most recently expired, up to the limit.
pub fn project_exception_refs(exceptions: &[ScheduleException]) -> Vec<ExceptionReference> {
    let mut refs: Vec<ExceptionReference> = exceptions
        .iter()
        .filter(|e| state_of(e) != ExceptionState::Expired)
        .map(reference_of)
        .collect();

    let mut expired: Vec<&ScheduleException> = exceptions
        .iter()
        .filter(|e| state_of(e) == ExceptionState::Expired)
        .collect();
    expired.sort_by(|a, b| {
        let at = |e: &ScheduleException| e.status.as_ref().and_then(|s| s.expired_at.clone());
        at(b).cmp(&at(a))
    });
    for exception in expired {
        if refs.len() >= EXCEPTION_REFERENCE_LIMIT {
            break;
        }
        refs.push(reference_of(exception));
    }
    refs.truncate(EXCEPTION_REFERENCE_LIMIT);
    refs
}

/// Picks the one exception in effect right now: Active state, validity
/// interval containing `now`, ties broken by newest creation timestamp so a
/// freshly-created override beats a lingering older one.
pub fn select_active_exception(
    exceptions: &[ScheduleException],
    now: DateTime<Utc>,
) -> Option<ActiveException> {
    let mut candidates: Vec<&ScheduleException> = exceptions
        .iter()
        .filter(|e| state_of(e) == ExceptionState::Active)
        .filter(|e| {
            let from = time::to_chrono(&e.spec.valid_from);
            let until = time::to_chrono(&e.spec.valid_until);
            matches!((from, until), (Some(f), Some(u)) if f <= now && now <= u)
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });
    let chosen = candidates.first()?;

    // Malformed lead times are ignored rather than failing the evaluation.
    let lead_time = chosen
        .spec
        .lead_time
        .as_deref()
        .and_then(|raw| parse_duration::parse(raw).ok())
        .and_then(|d| chrono::Duration::from_std(d).ok());

    Some(ActiveException {
        name: chosen.name_any(),
        exception_type: chosen.spec.exception_type,
        windows: chosen.spec.windows.clone(),
        lead_time,
        valid_from: time::to_chrono(&chosen.spec.valid_from)?,
        valid_until: time::to_chrono(&chosen.spec.valid_until)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hibernator_types::{
        ExceptionType, PlanReference, ScheduleExceptionSpec, ScheduleExceptionStatus,
    };

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0).unwrap()
    }

    fn exception(
        name: &str,
        state: ExceptionState,
        created: DateTime<Utc>,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> ScheduleException {
        let mut exc = ScheduleException::new(
            name,
            ScheduleExceptionSpec {
                plan_ref: PlanReference {
                    name: "nightly".to_string(),
                },
                exception_type: ExceptionType::Suspend,
                valid_from: time::from_chrono(valid_from),
                valid_until: time::from_chrono(valid_until),
                windows: vec![],
                lead_time: Some("1h".to_string()),
            },
        );
        exc.metadata.creation_timestamp = Some(time::from_chrono(created));
        exc.status = Some(ScheduleExceptionStatus {
            state,
            applied_at: None,
            expired_at: match state {
                ExceptionState::Expired => Some(time::from_chrono(valid_until)),
                _ => None,
            },
            last_updated: None,
        });
        exc
    }

    #[test]
    fn selection_requires_active_state_and_validity() {
        let now = at(15, 12);
        let exceptions = vec![
            exception("pending", ExceptionState::Pending, at(1, 0), at(10, 0), at(20, 0)),
            exception("expired", ExceptionState::Expired, at(1, 0), at(1, 0), at(5, 0)),
            exception("out-of-window", ExceptionState::Active, at(1, 0), at(16, 0), at(20, 0)),
        ];
        assert!(select_active_exception(&exceptions, now).is_none());
        let mut with_active = exceptions;
        with_active.push(exception(
            "live",
            ExceptionState::Active,
            at(2, 0),
            at(10, 0),
            at(20, 0),
        ));
        let chosen = select_active_exception(&with_active, now).unwrap();
        assert_eq!(chosen.name, "live");
        assert_eq!(chosen.lead_time, Some(chrono::Duration::hours(1)));
    }

    #[test]
    fn newest_creation_wins_ties() {
        let now = at(15, 12);
        let exceptions = vec![
            exception("older", ExceptionState::Active, at(1, 0), at(10, 0), at(20, 0)),
            exception("newer", ExceptionState::Active, at(5, 0), at(10, 0), at(20, 0)),
        ];
        let chosen = select_active_exception(&exceptions, now).unwrap();
        assert_eq!(chosen.name, "newer");
    }

    #[test]
    fn malformed_lead_time_is_ignored() {
        let mut exc = exception("live", ExceptionState::Active, at(1, 0), at(10, 0), at(20, 0));
        exc.spec.lead_time = Some("not-a-duration".to_string());
        let chosen = select_active_exception(&[exc], at(15, 12)).unwrap();
        assert_eq!(chosen.lead_time, None);
    }

    #[test]
    fn projection_keeps_live_first_then_newest_expired() {
        let mut exceptions: Vec<ScheduleException> = (0..8)
            .map(|i| {
                exception(
                    &format!("live-{i}"),
                    ExceptionState::Active,
                    at(1, i),
                    at(10, 0),
                    at(20, 0),
                )
            })
            .collect();
        for i in 0..4 {
            exceptions.push(exception(
                &format!("expired-{i}"),
                ExceptionState::Expired,
                at(1, 0),
                at(1, 0),
                at(2, i), // expired_at follows valid_until
            ));
        }
        let refs = project_exception_refs(&exceptions);
        assert_eq!(refs.len(), EXCEPTION_REFERENCE_LIMIT);
        assert!(refs[..8].iter().all(|r| r.state == ExceptionState::Active));
        // Only the two newest expired fit.
        assert_eq!(refs[8].name, "expired-3");
        assert_eq!(refs[9].name, "expired-2");
    }
}
