//! The `ScheduleException` controller: walks each exception through
//! `Pending -> Active -> Expired` on its validity interval and keeps the
//! plan routing label in place. Admission-time validation is a webhook
//! concern, not handled here.

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use hibernator_common::labels;
use hibernator_types::*;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::util::Error;
use crate::util::patch::{patch_object, patch_status, time};

/// Entrypoint for the `ScheduleException` controller.
pub async fn run(client: Client, controller_namespace: String) -> Result<(), Error> {
    println!("{}", "⚙️ Starting ScheduleException controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData {
        client: client.clone(),
    });

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("hibernator-exception-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "hibernator-exception-controller-lock".to_string();
    let leadership = LeaseLock::new(
        client.clone(),
        &controller_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        hibernator_common::shutdown::shutdown_signal("ScheduleException").await;
        shutdown_signal.cancel();
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                let api: Api<ScheduleException> = Api::all(client.clone());
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 ScheduleException controller started.".green());
                    Controller::new(api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
}

#[derive(Debug, PartialEq, Clone)]
enum ExceptionAction {
    /// The routing label is missing or wrong; fix it first.
    EnsurePlanLabel,
    /// Validity began: Pending -> Active.
    Activate,
    /// Validity ended: -> Expired.
    Expire,
    /// Not yet due; come back at the next boundary.
    Requeue(Duration),
    NoOp,
}

fn determine_exception_action(exception: &ScheduleException, now: DateTime<Utc>) -> ExceptionAction {
    if exception.metadata.deletion_timestamp.is_some() {
        return ExceptionAction::NoOp;
    }
    if exception.labels().get(labels::PLAN) != Some(&exception.spec.plan_ref.name) {
        return ExceptionAction::EnsurePlanLabel;
    }

    let state = exception
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default();
    let valid_from = time::to_chrono(&exception.spec.valid_from);
    let valid_until = time::to_chrono(&exception.spec.valid_until);
    let (Some(valid_from), Some(valid_until)) = (valid_from, valid_until) else {
        return ExceptionAction::NoOp;
    };

    match state {
        ExceptionState::Pending => {
            if now > valid_until {
                ExceptionAction::Expire
            } else if now >= valid_from {
                ExceptionAction::Activate
            } else {
                let delay = (valid_from - now)
                    .to_std()
                    .unwrap_or_default()
                    .saturating_add(Duration::from_secs(1));
                ExceptionAction::Requeue(delay)
            }
        }
        ExceptionState::Active => {
            if now > valid_until {
                ExceptionAction::Expire
            } else {
                let delay = (valid_until - now)
                    .to_std()
                    .unwrap_or_default()
                    .saturating_add(Duration::from_secs(1));
                ExceptionAction::Requeue(delay)
            }
        }
        ExceptionState::Expired => ExceptionAction::NoOp,
    }
}

async fn reconcile(
    instance: Arc<ScheduleException>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let client = context.client.clone();
    if instance.namespace().is_none() {
        return Err(Error::UserInput(
            "Expected ScheduleException resource to be namespaced.".to_owned(),
        ));
    }
    let now = time::now_chrono();

    match determine_exception_action(&instance, now) {
        ExceptionAction::EnsurePlanLabel => {
            let plan_name = instance.spec.plan_ref.name.clone();
            patch_object(client, &*instance, move |e: &mut ScheduleException| {
                e.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(labels::PLAN.to_string(), plan_name);
            })
            .await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        ExceptionAction::Activate => {
            patch_status(client, &*instance, move |s: &mut ScheduleExceptionStatus| {
                s.state = ExceptionState::Active;
                s.applied_at = Some(time::from_chrono(now));
            })
            .await?;
            println!(
                "{}",
                format!("⏰ exception {:?} is now active", instance.name_any()).green()
            );
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        ExceptionAction::Expire => {
            patch_status(client, &*instance, move |s: &mut ScheduleExceptionStatus| {
                s.state = ExceptionState::Expired;
                s.expired_at = Some(time::from_chrono(now));
            })
            .await?;
            println!(
                "{}",
                format!("⏰ exception {:?} expired", instance.name_any()).dimmed()
            );
            Ok(Action::await_change())
        }
        ExceptionAction::Requeue(delay) => Ok(Action::requeue(delay)),
        ExceptionAction::NoOp => Ok(Action::await_change()),
    }
}

fn on_error(instance: Arc<ScheduleException>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for exception {:?}: {:?}",
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0).unwrap()
    }

    fn exception(state: ExceptionState, labeled: bool) -> ScheduleException {
        let mut exc = ScheduleException::new(
            "window-freeze",
            ScheduleExceptionSpec {
                plan_ref: PlanReference {
                    name: "nightly".to_string(),
                },
                exception_type: ExceptionType::Suspend,
                valid_from: time::from_chrono(at(10, 0)),
                valid_until: time::from_chrono(at(20, 0)),
                windows: vec![],
                lead_time: None,
            },
        );
        if labeled {
            exc.metadata.labels = Some(
                [(labels::PLAN.to_string(), "nightly".to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        exc.status = Some(ScheduleExceptionStatus {
            state,
            ..Default::default()
        });
        exc
    }

    #[test]
    fn missing_label_is_fixed_first() {
        let exc = exception(ExceptionState::Pending, false);
        assert_eq!(
            determine_exception_action(&exc, at(15, 0)),
            ExceptionAction::EnsurePlanLabel
        );
    }

    #[test]
    fn pending_activates_inside_its_validity() {
        let exc = exception(ExceptionState::Pending, true);
        assert_eq!(determine_exception_action(&exc, at(15, 0)), ExceptionAction::Activate);
        // Exactly at validFrom counts.
        assert_eq!(determine_exception_action(&exc, at(10, 0)), ExceptionAction::Activate);
    }

    #[test]
    fn pending_before_validity_requeues() {
        let exc = exception(ExceptionState::Pending, true);
        assert!(matches!(
            determine_exception_action(&exc, at(5, 0)),
            ExceptionAction::Requeue(_)
        ));
    }

    #[test]
    fn stale_pending_expires_directly() {
        let exc = exception(ExceptionState::Pending, true);
        assert_eq!(determine_exception_action(&exc, at(25, 0)), ExceptionAction::Expire);
    }

    #[test]
    fn active_expires_past_valid_until() {
        let exc = exception(ExceptionState::Active, true);
        assert_eq!(determine_exception_action(&exc, at(21, 0)), ExceptionAction::Expire);
        assert!(matches!(
            determine_exception_action(&exc, at(15, 0)),
            ExceptionAction::Requeue(_)
        ));
    }

    #[test]
    fn expired_is_terminal() {
        let exc = exception(ExceptionState::Expired, true);
        assert_eq!(determine_exception_action(&exc, at(25, 0)), ExceptionAction::NoOp);
    }
}
