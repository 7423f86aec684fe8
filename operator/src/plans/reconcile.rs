//! The `HibernatePlan` controller: a phase machine driven by reconcile
//! passes. Each pass reads the fresh plan, applies the suspension rules,
//! evaluates the schedule, and dispatches on the current phase.

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use hibernator_common::annotations;
use hibernator_types::*;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    Api, ResourceExt,
    api::DeleteParams,
    client::Client,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::{OwoColorize, Rgb};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::restore::{ConfigMapRestoreStore, RestoreStore};
use super::suspend::{self, SuspensionStep};
use super::{exceptions, execution, jobs, planner, recovery};
use crate::schedule::evaluate::{ScheduleEvaluator, ScheduleResult};
use crate::util::patch::{patch_object, patch_status, time};
use crate::util::{
    Error, REQUEUE_DURING_STAGE, REQUEUE_FOR_SCHEDULE_EXCEPTION, REQUEUE_ON_SCHEDULE_ERROR,
    REQUEUE_WHILE_PARKED,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Night-shift log accents: dim separators, moonlit names.
const LOG_DIM: Rgb = Rgb(108, 112, 134);
const LOG_NAME: Rgb = Rgb(137, 180, 250);

/// Entrypoint for the `HibernatePlan` controller.
pub async fn run(
    client: Client,
    evaluator: ScheduleEvaluator,
    runner: jobs::RunnerConfig,
    controller_namespace: String,
) -> Result<(), Error> {
    println!("{}", "⚙️ Starting HibernatePlan controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), evaluator, runner));

    // Leadership is scoped to the controller namespace so RBAC can stay
    // namespaced rather than cluster-scoped.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("hibernator-plan-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "hibernator-plan-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &controller_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        hibernator_common::shutdown::shutdown_signal("HibernatePlan").await;
        shutdown_signal.cancel();
    });
    hibernator_common::signal_ready();

    // Only the leader runs the controller; on leadership loss the task is
    // aborted and this replica goes back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
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
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let plans_api: Api<HibernatePlan> = Api::all(client_for_controller.clone());
                let jobs_api: Api<Job> = Api::all(client_for_controller.clone());
                let exceptions_api: Api<ScheduleException> = Api::all(client_for_controller);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 HibernatePlan controller started.".green());
                    Controller::new(plans_api, Default::default())
                        .owns(jobs_api, Default::default())
                        .watches(
                            exceptions_api,
                            watcher::Config::default(),
                            |exception: ScheduleException| {
                                let namespace = exception.namespace()?;
                                Some(
                                    ObjectRef::new(&exception.spec.plan_ref.name)
                                        .within(&namespace),
                                )
                            },
                        )
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

/// Context injected with each `reconcile` and `on_error` method invocation.
pub struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    pub(crate) client: Client,
    pub(crate) evaluator: ScheduleEvaluator,
    pub(crate) runner: jobs::RunnerConfig,
    pub(crate) restore: ConfigMapRestoreStore,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (PlanAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, evaluator: ScheduleEvaluator, runner: jobs::RunnerConfig) -> Self {
        let restore = ConfigMapRestoreStore::new(client.clone());
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                evaluator,
                runner,
                restore,
                metrics: ControllerMetrics::new("plans"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                evaluator,
                runner,
                restore,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// Action decided by the read phase of a reconcile pass.
#[derive(Debug, PartialEq, Clone)]
enum PlanAction {
    /// Off-hours began: mint a cycle and dispatch the first shutdown stage.
    StartShutdown,
    /// Drive the in-flight shutdown forward.
    ContinueShutdown,
    /// Schedule still says sleep but everything is already down.
    AlreadyHibernated,
    /// Off-hours ended: replay the cycle's stages in reverse.
    StartWakeup,
    ContinueWakeup,
    /// Parked in Suspended; the suspension rules own the exit.
    Parked,
    /// Parked in Error; retry pacing owns the exit.
    Recover,
    /// Nothing to do until the next schedule boundary.
    FollowSchedule,
}

impl PlanAction {
    fn to_str(&self) -> &str {
        match self {
            PlanAction::StartShutdown => "StartShutdown",
            PlanAction::ContinueShutdown => "ContinueShutdown",
            PlanAction::AlreadyHibernated => "AlreadyHibernated",
            PlanAction::StartWakeup => "StartWakeup",
            PlanAction::ContinueWakeup => "ContinueWakeup",
            PlanAction::Parked => "Parked",
            PlanAction::Recover => "Recover",
            PlanAction::FollowSchedule => "FollowSchedule",
        }
    }
}

fn determine_phase_action(phase: Option<PlanPhase>, should_hibernate: bool) -> PlanAction {
    match phase {
        Some(PlanPhase::Active) | None => {
            if should_hibernate {
                PlanAction::StartShutdown
            } else {
                PlanAction::FollowSchedule
            }
        }
        Some(PlanPhase::Hibernating) => PlanAction::ContinueShutdown,
        Some(PlanPhase::Hibernated) => {
            if should_hibernate {
                PlanAction::AlreadyHibernated
            } else {
                PlanAction::StartWakeup
            }
        }
        Some(PlanPhase::WakingUp) => PlanAction::ContinueWakeup,
        Some(PlanPhase::Suspended) => PlanAction::Parked,
        Some(PlanPhase::Error) => PlanAction::Recover,
    }
}

/// 8-char opaque cycle token; a new one appears only at shutdown start.
fn mint_cycle_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reconciliation function for the `HibernatePlan` resource.
async fn reconcile(instance: Arc<HibernatePlan>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected HibernatePlan resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Always act on the freshest copy: every mutation below diffs against
    // what the API server holds right now, not a cache snapshot.
    let api: Api<HibernatePlan> = Api::namespaced(client.clone(), &namespace);
    let Some(plan) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };
    let now = time::now_chrono();

    if plan.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&context, &plan).await;
    }

    // Attach the finalizer on first observation and let the watch
    // re-deliver with it present.
    if !plan.finalizers().iter().any(|f| f == FINALIZER) {
        patch_object(client.clone(), &plan, |p| {
            p.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
        })
        .await?;
        return Ok(Action::await_change());
    }

    // First observation: land in Active and set up the restore store.
    if plan.status.as_ref().and_then(|s| s.phase).is_none() {
        let generation = plan.metadata.generation.unwrap_or_default();
        let plan = patch_status(client.clone(), &plan, move |s: &mut HibernatePlanStatus| {
            s.phase = Some(PlanPhase::Active);
            s.observed_generation = generation;
            s.last_transition_time = Some(time::from_chrono(now));
        })
        .await?;
        context
            .restore
            .prepare_restore_point(&namespace, &plan)
            .await?;
        return Ok(Action::await_change());
    }

    // Suspension rules run before anything else and may end the pass.
    let step = suspend::determine_suspension_step(&plan, now);
    if let Some(action) = apply_suspension(&context, &plan, step, now).await? {
        return Ok(action);
    }

    // Keep the exception references on status fresh. A listing failure is
    // logged and degrades to "no exceptions" for this pass.
    let plan_exceptions =
        match exceptions::list_plan_exceptions(client.clone(), &namespace, &name).await {
            Ok(list) => list,
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("listing exceptions for {:?} failed: {}", name, e).yellow()
                );
                Vec::new()
            }
        };

    // Schedule decision.
    let active_exception = exceptions::select_active_exception(&plan_exceptions, now);
    let schedule_result =
        match context
            .evaluator
            .evaluate(&plan.spec.schedule, active_exception.as_ref(), now)
        {
            Ok(result) => result,
            Err(e) => {
                return set_error(
                    &context,
                    &plan,
                    format!("schedule evaluation failed: {}", e),
                    now,
                )
                .await;
            }
        };

    // Surface what this pass observed, but only when something changed.
    let plan = observe(&context, plan, &plan_exceptions, &schedule_result).await?;

    let phase = plan.status.as_ref().and_then(|s| s.phase);
    let action = determine_phase_action(phase, schedule_result.should_hibernate);

    let value = {
        let mut la = context.last_action.lock().await;
        la.insert(
            (namespace.clone(), name.clone()),
            (action.clone(), Instant::now()),
        )
    };
    if let Some((last_action, last_instant)) = value
        && (Some(&action) != Some(&last_action) || last_instant.elapsed() > Duration::from_secs(300))
    {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(LOG_NAME),
            "/".color(LOG_DIM),
            name.color(LOG_NAME),
            " ACTION: ".color(LOG_DIM),
            format!("{:?}", action).color(LOG_NAME),
        );
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = Some(
        context
            .metrics
            .write_histogram
            .with_label_values(&[&name, &namespace, action.to_str()])
            .start_timer(),
    );

    let result = match action {
        PlanAction::StartShutdown => {
            start_operation(&context, &plan, Operation::Shutdown, now).await
        }
        PlanAction::ContinueShutdown => {
            execution::reconcile_execution(&context, &plan, Operation::Shutdown, now).await
        }
        PlanAction::AlreadyHibernated => {
            println!(
                "{}",
                format!("plan {:?} already hibernated, skipping duplicate shutdown", name).dimmed()
            );
            Ok(Action::requeue(REQUEUE_WHILE_PARKED))
        }
        PlanAction::StartWakeup => start_wakeup(&context, &plan, now).await,
        PlanAction::ContinueWakeup => {
            execution::reconcile_execution(&context, &plan, Operation::Wakeup, now).await
        }
        PlanAction::Parked => Ok(Action::requeue(REQUEUE_WHILE_PARKED)),
        PlanAction::Recover => {
            handle_error_recovery(&context, &plan, &schedule_result, now).await
        }
        PlanAction::FollowSchedule => Ok(Action::requeue(
            context.evaluator.next_requeue_time(&schedule_result, now),
        )),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    result
}

/// Guarded status patch for the pass's observations: exception references,
/// next event times, and the observed generation.
async fn observe(
    context: &ContextData,
    plan: HibernatePlan,
    plan_exceptions: &[ScheduleException],
    schedule_result: &ScheduleResult,
) -> Result<HibernatePlan, Error> {
    let refs = exceptions::project_exception_refs(plan_exceptions);
    let next_hibernate = schedule_result.next_hibernate.map(time::from_chrono);
    let next_wake_up = schedule_result.next_wake_up.map(time::from_chrono);
    let generation = plan.metadata.generation.unwrap_or_default();
    let status = plan.status.clone().unwrap_or_default();
    if status.active_exceptions == refs
        && status.next_hibernate == next_hibernate
        && status.next_wake_up == next_wake_up
        && status.observed_generation == generation
    {
        return Ok(plan);
    }
    Ok(patch_status(context.client.clone(), &plan, move |s: &mut HibernatePlanStatus| {
        s.active_exceptions = refs;
        s.next_hibernate = next_hibernate;
        s.next_wake_up = next_wake_up;
        s.observed_generation = generation;
    })
    .await?)
}

/// Applies a suspension step; `Some(action)` ends the reconcile pass.
async fn apply_suspension(
    context: &ContextData,
    plan: &HibernatePlan,
    step: SuspensionStep,
    now: DateTime<Utc>,
) -> Result<Option<Action>, Error> {
    let phase = plan.status.as_ref().and_then(|s| s.phase);
    match step {
        SuspensionStep::None => Ok(None),
        SuspensionStep::ClearExpiredDeadline => {
            patch_object(context.client.clone(), plan, |p| {
                p.spec.suspend = false;
                if let Some(existing) = p.metadata.annotations.as_mut() {
                    existing.remove(annotations::SUSPEND_UNTIL);
                    existing.remove(annotations::SUSPEND_REASON);
                }
            })
            .await?;
            Ok(Some(Action::requeue(Duration::from_secs(1))))
        }
        SuspensionStep::EnforceDeadline {
            requeue,
            needs_suspend_patch,
        } => {
            let plan = if needs_suspend_patch {
                patch_object(context.client.clone(), plan, |p| {
                    p.spec.suspend = true;
                })
                .await?
            } else {
                plan.clone()
            };
            if phase != Some(PlanPhase::Suspended) {
                enter_suspension(context, &plan, phase, now).await?;
            }
            Ok(Some(Action::requeue(requeue)))
        }
        SuspensionStep::EnterSuspension { stash_phase } => {
            enter_suspension(context, plan, stash_phase, now).await?;
            Ok(Some(Action::requeue(REQUEUE_WHILE_PARKED)))
        }
        SuspensionStep::Resume { suspended_at } => {
            let namespace = plan.namespace().unwrap_or_default();
            let name = plan.name_any();
            let mut force_wake = false;
            if suspended_at.is_some_and(suspend::phase_implies_wake_needed)
                && context
                    .restore
                    .has_restore_data(&namespace, &name)
                    .await
                    .unwrap_or(false)
            {
                // Wake only when the schedule says the targets should be up.
                let plan_exceptions =
                    exceptions::list_plan_exceptions(context.client.clone(), &namespace, &name)
                        .await
                        .unwrap_or_default();
                let active = exceptions::select_active_exception(&plan_exceptions, now);
                force_wake = context
                    .evaluator
                    .evaluate(&plan.spec.schedule, active.as_ref(), now)
                    .map(|r| !r.should_hibernate)
                    .unwrap_or(false);
            }
            if force_wake {
                println!(
                    "{}",
                    format!("plan {:?} resuming from suspension into wake-up", name).green()
                );
                return Ok(Some(
                    start_operation(context, plan, Operation::Wakeup, now).await?,
                ));
            }
            patch_status(context.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
                s.phase = Some(PlanPhase::Active);
                s.last_transition_time = Some(time::from_chrono(now));
            })
            .await?;
            Ok(Some(Action::requeue(REQUEUE_FOR_SCHEDULE_EXCEPTION)))
        }
    }
}

async fn enter_suspension(
    context: &ContextData,
    plan: &HibernatePlan,
    stash_phase: Option<PlanPhase>,
    now: DateTime<Utc>,
) -> Result<HibernatePlan, Error> {
    // Stash where we were so resume can decide whether a wake-up is owed.
    let plan = match stash_phase {
        Some(phase) if phase != PlanPhase::Suspended => {
            patch_object(context.client.clone(), plan, |p| {
                p.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(annotations::SUSPENDED_AT_PHASE.to_string(), phase.to_string());
            })
            .await?
        }
        _ => plan.clone(),
    };
    Ok(
        patch_status(context.client.clone(), &plan, move |s: &mut HibernatePlanStatus| {
            s.phase = Some(PlanPhase::Suspended);
            s.error_message = None;
            s.last_transition_time = Some(time::from_chrono(now));
        })
        .await?,
    )
}

/// Starts an operation: resets the execution slate, lands in the working
/// phase, and dispatches stage zero.
pub(crate) async fn start_operation(
    context: &ContextData,
    plan: &HibernatePlan,
    operation: Operation,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let name = plan.name_any();

    // Validate the strategy before touching status.
    let exec_plan = match planner::build_execution_plan(
        &plan.spec.targets,
        &plan.spec.execution.strategy,
        operation,
    ) {
        Ok(p) => p,
        Err(e) => return set_error(context, plan, e.to_string(), now).await,
    };

    let status = plan.status.clone().unwrap_or_default();
    let cycle_id = match operation {
        Operation::Shutdown => mint_cycle_id(),
        Operation::Wakeup => match status.current_cycle_id.clone() {
            Some(id) => id,
            None => {
                return set_error(
                    context,
                    plan,
                    "wake-up requested without a recorded shutdown cycle".to_string(),
                    now,
                )
                .await;
            }
        },
    };

    let restore_ref = context.restore.restore_config_map(&name);
    let executions: Vec<ExecutionStatus> = plan
        .spec
        .targets
        .iter()
        .map(|t| ExecutionStatus {
            target: t.name.clone(),
            executor: t.target_type.clone(),
            state: ExecutionState::Pending,
            restore_config_map_ref: Some(restore_ref.clone()),
            ..Default::default()
        })
        .collect();

    let working_phase = match operation {
        Operation::Shutdown => PlanPhase::Hibernating,
        Operation::Wakeup => PlanPhase::WakingUp,
    };
    let patched_cycle_id = cycle_id.clone();
    let plan = patch_status(context.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
        s.phase = Some(working_phase);
        s.current_cycle_id = Some(patched_cycle_id);
        s.current_operation = Some(operation);
        s.current_stage_index = 0;
        s.executions = executions;
        s.last_transition_time = Some(time::from_chrono(now));
    })
    .await?;
    println!(
        "{}",
        format!(
            "🌙 plan {}/{} starting {} (cycle {})",
            namespace, name, operation, cycle_id
        )
        .green()
    );

    let owned_jobs =
        jobs::list_cycle_jobs(context.client.clone(), &namespace, &name, operation, &cycle_id)
            .await?;
    if let Some(action) =
        execution::execute_stage(context, &plan, &exec_plan, 0, operation, &owned_jobs, now).await?
    {
        return Ok(action);
    }
    Ok(Action::requeue(REQUEUE_DURING_STAGE))
}

/// Wake-ups must not start without restore data to replay.
async fn start_wakeup(
    context: &ContextData,
    plan: &HibernatePlan,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let name = plan.name_any();
    if !context.restore.has_restore_data(&namespace, &name).await? {
        return set_error(
            context,
            plan,
            "no restore data found; cannot start wake-up".to_string(),
            now,
        )
        .await;
    }
    start_operation(context, plan, Operation::Wakeup, now).await
}

/// Error-phase handling: permanent or exhausted failures stay put; due
/// retries retire the failed jobs, reset their executions, and re-enter the
/// working phase the schedule asks for.
async fn handle_error_recovery(
    context: &ContextData,
    plan: &HibernatePlan,
    schedule_result: &ScheduleResult,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let name = plan.name_any();
    let status = plan.status.clone().unwrap_or_default();

    let strategy =
        recovery::determine_recovery_strategy(&status, plan.spec.behavior.retries, now);
    if !strategy.should_retry {
        return Ok(Action::requeue(REQUEUE_ON_SCHEDULE_ERROR));
    }
    if strategy.retry_after > std::time::Duration::ZERO {
        return Ok(Action::requeue(strategy.retry_after));
    }

    let (target_phase, target_operation) = if schedule_result.should_hibernate {
        (PlanPhase::Hibernating, Operation::Shutdown)
    } else {
        (PlanPhase::WakingUp, Operation::Wakeup)
    };

    // Retire this cycle's failed jobs so the at-most-one rule lets us
    // launch replacements.
    if let (Some(cycle_id), Some(current_operation)) =
        (status.current_cycle_id.as_deref(), status.current_operation)
    {
        let owned_jobs = jobs::list_cycle_jobs(
            context.client.clone(),
            &namespace,
            &name,
            current_operation,
            cycle_id,
        )
        .await?;
        for job in owned_jobs.iter().filter(|j| !jobs::is_stale(j)) {
            if matches!(jobs::derive_job_state(job), jobs::RunnerJobState::Failed { .. }) {
                jobs::mark_job_stale(context.client.clone(), job, "retry-recovery").await?;
            }
        }
    }

    let message = status.error_message.clone().unwrap_or_default();
    let same_operation = status.current_operation == Some(target_operation);
    let restore_ref = context.restore.restore_config_map(&name);
    let targets: Vec<(String, String)> = plan
        .spec
        .targets
        .iter()
        .map(|t| (t.name.clone(), t.target_type.clone()))
        .collect();
    patch_status(context.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
        recovery::record_retry_attempt(s, &message, now);
        if same_operation {
            for e in s.executions.iter_mut() {
                if e.state == ExecutionState::Failed {
                    e.state = ExecutionState::Pending;
                    e.message = None;
                    e.finished_at = None;
                    e.job_ref = None;
                }
            }
        } else {
            // The schedule moved on while we were in Error; restart the
            // cycle's other half from a clean slate.
            s.current_operation = Some(target_operation);
            s.current_stage_index = 0;
            s.executions = targets
                .iter()
                .map(|(target, executor)| ExecutionStatus {
                    target: target.clone(),
                    executor: executor.clone(),
                    state: ExecutionState::Pending,
                    restore_config_map_ref: Some(restore_ref.clone()),
                    ..Default::default()
                })
                .collect();
        }
        s.phase = Some(target_phase);
        s.last_transition_time = Some(time::from_chrono(now));
    })
    .await?;
    println!(
        "{}",
        format!(
            "♻️ plan {}/{} recovering from error into {}",
            namespace, name, target_phase
        )
        .green()
    );
    Ok(Action::requeue(REQUEUE_DURING_STAGE))
}

/// Moves the plan into Error with the message persisted verbatim.
pub(crate) async fn set_error(
    context: &ContextData,
    plan: &HibernatePlan,
    message: String,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    eprintln!(
        "{}",
        format!("🛑 plan {:?} entering Error: {}", plan.name_any(), message).red()
    );
    patch_status(context.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
        s.phase = Some(PlanPhase::Error);
        s.error_message = Some(message);
        s.last_transition_time = Some(time::from_chrono(now));
    })
    .await?;
    Ok(Action::requeue(REQUEUE_ON_SCHEDULE_ERROR))
}

/// Deletion under the finalizer: delete owned jobs with background
/// propagation, then release the finalizer.
async fn handle_deletion(context: &ContextData, plan: &HibernatePlan) -> Result<Action, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let name = plan.name_any();
    let owned_jobs = jobs::list_plan_jobs(context.client.clone(), &namespace, &name).await?;
    let api: Api<Job> = Api::namespaced(context.client.clone(), &namespace);
    for job in owned_jobs {
        match api
            .delete(&job.name_any(), &DeleteParams::background())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    if plan.finalizers().iter().any(|f| f == FINALIZER) {
        match patch_object(context.client.clone(), plan, |p| {
            if let Some(finalizers) = p.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER);
            }
        })
        .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    println!(
        "{}",
        format!("🗑️ plan {}/{} cleaned up for deletion", namespace, name).dimmed()
    );
    Ok(Action::await_change())
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(instance: Arc<HibernatePlan>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {:?}: {:?}",
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
