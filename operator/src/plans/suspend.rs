//! The suspension sub-machine: an explicit `spec.suspend` toggle and a
//! `suspend-until` deadline annotation cooperate to park a plan in the
//! Suspended phase and bring it back out.

use chrono::{DateTime, Utc};
use hibernator_common::annotations;
use hibernator_types::{HibernatePlan, PlanPhase};
use kube::ResourceExt;
use std::str::FromStr;
use std::time::Duration;

/// What the suspension rules want done before any phase dispatch happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuspensionStep {
    /// No suspension bookkeeping needed.
    None,
    /// The deadline annotation has passed: clear `spec.suspend` and drop
    /// the annotation.
    ClearExpiredDeadline,
    /// The deadline is in the future: keep `spec.suspend` set and come
    /// back just after the deadline.
    EnforceDeadline {
        requeue: Duration,
        needs_suspend_patch: bool,
    },
    /// `spec.suspend` is set but the phase has not caught up: stash the
    /// current phase and enter Suspended.
    EnterSuspension { stash_phase: Option<PlanPhase> },
    /// `spec.suspend` was cleared while Suspended: leave, possibly forcing
    /// a wake-up depending on the stashed phase.
    Resume { suspended_at: Option<PlanPhase> },
}

pub fn suspended_at_phase(plan: &HibernatePlan) -> Option<PlanPhase> {
    plan.annotations()
        .get(annotations::SUSPENDED_AT_PHASE)
        .and_then(|raw| PlanPhase::from_str(raw).ok())
}

/// A stashed phase that implies workloads may still be down.
pub fn phase_implies_wake_needed(phase: PlanPhase) -> bool {
    matches!(
        phase,
        PlanPhase::Hibernating | PlanPhase::Hibernated | PlanPhase::WakingUp
    )
}

pub fn determine_suspension_step(plan: &HibernatePlan, now: DateTime<Utc>) -> SuspensionStep {
    let phase = plan.status.as_ref().and_then(|s| s.phase);

    if let Some(raw) = plan.annotations().get(annotations::SUSPEND_UNTIL) {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(deadline) => {
                let deadline = deadline.with_timezone(&Utc);
                if now > deadline {
                    return SuspensionStep::ClearExpiredDeadline;
                }
                let requeue = (deadline - now)
                    .to_std()
                    .unwrap_or_default()
                    .saturating_add(Duration::from_secs(1));
                return SuspensionStep::EnforceDeadline {
                    requeue,
                    needs_suspend_patch: !plan.spec.suspend,
                };
            }
            // Malformed deadlines are treated as already expired so the
            // plan cannot get stuck suspended forever.
            Err(_) => return SuspensionStep::ClearExpiredDeadline,
        }
    }

    if plan.spec.suspend && phase != Some(PlanPhase::Suspended) {
        return SuspensionStep::EnterSuspension { stash_phase: phase };
    }
    if !plan.spec.suspend && phase == Some(PlanPhase::Suspended) {
        return SuspensionStep::Resume {
            suspended_at: suspended_at_phase(plan),
        };
    }
    SuspensionStep::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hibernator_types::{HibernatePlanSpec, HibernatePlanStatus};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0).unwrap()
    }

    fn plan(suspend: bool, phase: Option<PlanPhase>) -> HibernatePlan {
        let mut plan = HibernatePlan::new(
            "nightly",
            HibernatePlanSpec {
                suspend,
                ..Default::default()
            },
        );
        plan.status = Some(HibernatePlanStatus {
            phase,
            ..Default::default()
        });
        plan
    }

    fn annotate(plan: &mut HibernatePlan, key: &str, value: &str) {
        plan.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    #[test]
    fn no_step_for_a_plain_running_plan() {
        let plan = plan(false, Some(PlanPhase::Active));
        assert_eq!(determine_suspension_step(&plan, at(15, 12)), SuspensionStep::None);
    }

    #[test]
    fn past_deadline_clears_the_suspension() {
        let mut plan = plan(true, Some(PlanPhase::Suspended));
        annotate(&mut plan, annotations::SUSPEND_UNTIL, "2026-01-15T10:00:00Z");
        assert_eq!(
            determine_suspension_step(&plan, at(15, 12)),
            SuspensionStep::ClearExpiredDeadline
        );
    }

    #[test]
    fn future_deadline_enforces_and_requeues_past_it() {
        let mut plan = plan(false, Some(PlanPhase::Active));
        annotate(&mut plan, annotations::SUSPEND_UNTIL, "2026-01-15T14:00:00Z");
        let step = determine_suspension_step(&plan, at(15, 12));
        assert_eq!(
            step,
            SuspensionStep::EnforceDeadline {
                requeue: Duration::from_secs(2 * 3600 + 1),
                needs_suspend_patch: true,
            }
        );
    }

    #[test]
    fn malformed_deadline_is_treated_as_expired() {
        let mut plan = plan(true, Some(PlanPhase::Suspended));
        annotate(&mut plan, annotations::SUSPEND_UNTIL, "tomorrow-ish");
        assert_eq!(
            determine_suspension_step(&plan, at(15, 12)),
            SuspensionStep::ClearExpiredDeadline
        );
    }

    #[test]
    fn suspend_toggle_enters_suspension_stashing_the_phase() {
        let plan = plan(true, Some(PlanPhase::Hibernated));
        assert_eq!(
            determine_suspension_step(&plan, at(15, 12)),
            SuspensionStep::EnterSuspension {
                stash_phase: Some(PlanPhase::Hibernated)
            }
        );
    }

    #[test]
    fn clearing_the_toggle_resumes_with_the_stashed_phase() {
        let mut plan = plan(false, Some(PlanPhase::Suspended));
        annotate(&mut plan, annotations::SUSPENDED_AT_PHASE, "Hibernated");
        assert_eq!(
            determine_suspension_step(&plan, at(15, 12)),
            SuspensionStep::Resume {
                suspended_at: Some(PlanPhase::Hibernated)
            }
        );
    }

    #[test]
    fn stashed_phases_that_need_waking() {
        assert!(phase_implies_wake_needed(PlanPhase::Hibernated));
        assert!(phase_implies_wake_needed(PlanPhase::Hibernating));
        assert!(phase_implies_wake_needed(PlanPhase::WakingUp));
        assert!(!phase_implies_wake_needed(PlanPhase::Active));
        assert!(!phase_implies_wake_needed(PlanPhase::Error));
    }
}
