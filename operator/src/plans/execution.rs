//! The inner execution loop: refreshing per-target state from owned runner
//! jobs, walking stages under their concurrency bounds, and finalizing a
//! completed operation into the cycle history.

use chrono::{DateTime, Utc};
use hibernator_common::{annotations, labels};
use hibernator_types::{
    Dependency, ExecutionState, ExecutionStatus, ExecutionStrategy, FailureMode, HibernatePlan,
    HibernatePlanStatus, Operation, PlanPhase,
};
use k8s_openapi::api::batch::v1::Job;
use kube::{ResourceExt, runtime::controller::Action};
use owo_colors::OwoColorize;

use super::reconcile::{ContextData, set_error};
use super::restore::RestoreStore;
use super::{history, jobs, planner, recovery};
use crate::util::patch::{patch_object, patch_status, time};
use crate::util::{Error, REQUEUE_DURING_STAGE, REQUEUE_ON_EXECUTION};

/// Aggregated view of one stage's targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStatus {
    pub all_terminal: bool,
    pub has_running: bool,
    pub has_pending: bool,
    pub failed: usize,
    pub completed: usize,
}

/// Projects the stage targets through their execution entries. A target
/// with no entry counts as pending.
pub fn stage_status(stage_targets: &[String], executions: &[ExecutionStatus]) -> StageStatus {
    let mut status = StageStatus {
        all_terminal: true,
        ..Default::default()
    };
    for target in stage_targets {
        let state = executions
            .iter()
            .find(|e| &e.target == target)
            .map(|e| e.state)
            .unwrap_or(ExecutionState::Pending);
        match state {
            ExecutionState::Pending => {
                status.has_pending = true;
                status.all_terminal = false;
            }
            ExecutionState::Running => {
                status.has_running = true;
                status.all_terminal = false;
            }
            ExecutionState::Completed => status.completed += 1,
            ExecutionState::Failed => status.failed += 1,
        }
    }
    status
}

pub fn is_operation_complete(executions: &[ExecutionStatus]) -> bool {
    executions.iter().all(|e| e.state.is_terminal())
}

/// The live (non-stale) runner job for a target, if any.
pub fn find_job_for<'a>(jobs: &'a [Job], target: &str, executor: &str) -> Option<&'a Job> {
    jobs.iter()
        .filter(|j| !jobs::is_stale(j))
        .find(|j| jobs::matches_target(j, target, executor))
}

/// Derives the next execution entry from the matching job, or infers
/// completion when the job has been garbage-collected under us.
pub fn refresh_execution_entry(
    entry: &ExecutionStatus,
    job: Option<&Job>,
    restore_ref: &str,
) -> ExecutionStatus {
    let mut updated = entry.clone();
    match job {
        Some(job) => {
            match jobs::derive_job_state(job) {
                jobs::RunnerJobState::Completed { finished_at } => {
                    updated.state = ExecutionState::Completed;
                    if updated.finished_at.is_none() {
                        updated.finished_at = finished_at;
                    }
                }
                jobs::RunnerJobState::Failed { finished_at } => {
                    updated.state = ExecutionState::Failed;
                    if updated.finished_at.is_none() {
                        updated.finished_at = finished_at;
                    }
                }
                jobs::RunnerJobState::Running { started_at } => {
                    updated.state = ExecutionState::Running;
                    if updated.started_at.is_none() {
                        updated.started_at = started_at;
                    }
                }
                jobs::RunnerJobState::Pending => {}
            }
            updated.job_ref = Some(job.name_any());
            updated.logs_ref = job
                .labels()
                .get(labels::EXECUTION_ID)
                .map(|id| format!("execution-id={}", id));
            updated.attempts = jobs::job_attempts(job);
            updated.restore_config_map_ref = Some(restore_ref.to_string());
        }
        None => {
            // The job finished and was collected; trust the recorded finish.
            if updated.state == ExecutionState::Running && updated.finished_at.is_some() {
                updated.state = ExecutionState::Completed;
            }
        }
    }
    updated
}

/// Name of a failed prerequisite of `target` in the current walk
/// direction, if any. Shutdown walks the declared edges; wake-up walks
/// them backwards.
pub fn failed_upstream<'a>(
    target: &str,
    dependencies: &'a [Dependency],
    operation: Operation,
    executions: &[ExecutionStatus],
) -> Option<&'a str> {
    let failed = |name: &str| {
        executions
            .iter()
            .any(|e| e.target == name && e.state == ExecutionState::Failed)
    };
    dependencies.iter().find_map(|dep| match operation {
        Operation::Shutdown if dep.to == target && failed(&dep.from) => Some(dep.from.as_str()),
        Operation::Wakeup if dep.from == target && failed(&dep.to) => Some(dep.to.as_str()),
        _ => None,
    })
}

/// One pass of the execution loop for the current operation.
pub async fn reconcile_execution(
    ctx: &ContextData,
    plan: &HibernatePlan,
    operation: Operation,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let name = plan.name_any();
    let status = plan.status.clone().unwrap_or_default();
    let Some(cycle_id) = status.current_cycle_id.clone() else {
        return set_error(
            ctx,
            plan,
            format!("{} execution in progress without a cycle id", operation),
            now,
        )
        .await;
    };

    let owned_jobs =
        jobs::list_cycle_jobs(ctx.client.clone(), &namespace, &name, operation, &cycle_id).await?;

    // Refresh per-target state from the owned jobs, then patch only when
    // something actually moved.
    let restore_ref = ctx.restore.restore_config_map(&name);
    let mut refreshed = Vec::with_capacity(status.executions.len());
    for entry in &status.executions {
        let job = find_job_for(&owned_jobs, &entry.target, &entry.executor);
        let mut updated = refresh_execution_entry(entry, job, &restore_ref);
        if updated.state == ExecutionState::Failed
            && updated.message.is_none()
            && let Some(job) = job
        {
            // Best-effort: pull the runner's termination message.
            updated.message = jobs::failed_pod_message(ctx.client.clone(), job).await;
        }
        refreshed.push(updated);
    }
    let plan = if refreshed != status.executions {
        let executions = refreshed;
        patch_status(ctx.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
            s.executions = executions;
        })
        .await?
    } else {
        plan.clone()
    };
    let status = plan.status.clone().unwrap_or_default();

    let exec_plan = match planner::build_execution_plan(
        &plan.spec.targets,
        &plan.spec.execution.strategy,
        operation,
    ) {
        Ok(exec_plan) => exec_plan,
        // The strategy was edited into an invalid shape mid-flight.
        Err(e) => return set_error(ctx, &plan, e.to_string(), now).await,
    };
    let stage_index = status.current_stage_index as usize;
    let Some(stage) = exec_plan.stage(stage_index) else {
        // The strategy shrank under us; fall through to completion checks.
        if is_operation_complete(&status.executions) {
            return finalize_operation(ctx, &plan, operation, now).await;
        }
        return Ok(Action::requeue(REQUEUE_ON_EXECUTION));
    };

    let stage_state = stage_status(&stage.targets, &status.executions);
    if stage_state.all_terminal {
        if stage_state.failed > 0 && plan.spec.behavior.mode == FailureMode::Strict {
            return set_error(
                ctx,
                &plan,
                format!("one or more targets in stage {} failed", stage_index),
                now,
            )
            .await;
        }
        if stage_index + 1 < exec_plan.stages.len() {
            let plan = patch_status(ctx.client.clone(), &plan, move |s: &mut HibernatePlanStatus| {
                s.current_stage_index = (stage_index + 1) as u32;
            })
            .await?;
            if let Some(action) =
                execute_stage(ctx, &plan, &exec_plan, stage_index + 1, operation, &owned_jobs, now)
                    .await?
            {
                return Ok(action);
            }
            return Ok(Action::requeue(REQUEUE_DURING_STAGE));
        }
        if !is_operation_complete(&status.executions) {
            return Ok(Action::requeue(REQUEUE_ON_EXECUTION));
        }
        return finalize_operation(ctx, &plan, operation, now).await;
    }

    if stage_state.has_pending {
        if let Some(action) =
            execute_stage(ctx, &plan, &exec_plan, stage_index, operation, &owned_jobs, now).await?
        {
            return Ok(action);
        }
        return Ok(Action::requeue(REQUEUE_DURING_STAGE));
    }

    // Only running targets left; wait for their jobs to settle.
    Ok(Action::requeue(REQUEUE_ON_EXECUTION))
}

/// Launches runner jobs for the stage's pending targets, up to the stage's
/// concurrency budget. Returns an error action when a failed dependency or
/// a strict fail-fast create failure aborts the cycle.
pub async fn execute_stage(
    ctx: &ContextData,
    plan: &HibernatePlan,
    exec_plan: &planner::ExecutionPlan,
    stage_index: usize,
    operation: Operation,
    owned_jobs: &[Job],
    now: DateTime<Utc>,
) -> Result<Option<Action>, Error> {
    let Some(stage) = exec_plan.stage(stage_index) else {
        return Ok(None);
    };
    let status = plan.status.clone().unwrap_or_default();
    let Some(cycle_id) = status.current_cycle_id.clone() else {
        return Ok(None);
    };
    let name = plan.name_any();

    let dependencies: &[Dependency] = match &plan.spec.execution.strategy {
        ExecutionStrategy::Dag { dependencies, .. } => dependencies,
        _ => &[],
    };

    let budget = stage.max_concurrency.min(stage.targets.len()).max(1);
    let running = stage
        .targets
        .iter()
        .filter_map(|t| {
            plan.spec
                .targets
                .iter()
                .find(|target| &target.name == t)
                .and_then(|target| find_job_for(owned_jobs, &target.name, &target.target_type))
        })
        .filter(|job| {
            matches!(
                jobs::derive_job_state(job),
                jobs::RunnerJobState::Running { .. } | jobs::RunnerJobState::Pending
            )
        })
        .count();

    let mut created = 0usize;
    for target_name in &stage.targets {
        if let Some(blocker) = failed_upstream(target_name, dependencies, operation, &status.executions)
        {
            return Ok(Some(
                set_error(
                    ctx,
                    plan,
                    format!(
                        "target {:?} cannot run: upstream dependency {:?} failed",
                        target_name, blocker
                    ),
                    now,
                )
                .await?,
            ));
        }
        if running + created >= budget {
            break;
        }
        let Some(target) = plan.spec.targets.iter().find(|t| &t.name == target_name) else {
            eprintln!(
                "{}",
                format!(
                    "stage references unknown target {:?} in plan {:?}; skipping",
                    target_name, name
                )
                .yellow()
            );
            continue;
        };
        if find_job_for(owned_jobs, &target.name, &target.target_type).is_some() {
            continue;
        }

        let execution_id = jobs::execution_id(&name, &target.name, now.timestamp());
        let job = jobs::build_runner_job(
            plan,
            target,
            operation,
            &cycle_id,
            &execution_id,
            &ctx.runner,
        )?;
        match jobs::create_runner_job(ctx.client.clone(), &job).await {
            Ok(_) => created += 1,
            Err(e) => {
                if plan.spec.behavior.mode == FailureMode::Strict && plan.spec.behavior.fail_fast {
                    return Ok(Some(
                        set_error(
                            ctx,
                            plan,
                            format!(
                                "failed to create runner job for target {:?}: {}",
                                target.name, e
                            ),
                            now,
                        )
                        .await?,
                    ));
                }
                eprintln!(
                    "{}",
                    format!(
                        "failed to create runner job for target {:?}: {}; continuing",
                        target.name, e
                    )
                    .yellow()
                );
            }
        }
    }
    Ok(None)
}

/// Records the operation's outcome into the cycle history and lands the
/// plan in its resting phase. Idempotent across repeated reconciles.
pub async fn finalize_operation(
    ctx: &ContextData,
    plan: &HibernatePlan,
    operation: Operation,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let status = plan.status.clone().unwrap_or_default();
    let Some(cycle_id) = status.current_cycle_id.clone() else {
        return Ok(Action::requeue(REQUEUE_ON_EXECUTION));
    };
    let summary = history::build_summary(operation, &status.executions, time::from_chrono(now));
    let resting_phase = match operation {
        Operation::Shutdown => PlanPhase::Hibernated,
        Operation::Wakeup => PlanPhase::Active,
    };
    let plan = patch_status(ctx.client.clone(), plan, move |s: &mut HibernatePlanStatus| {
        history::record_cycle_summary(&mut s.execution_history, &cycle_id, summary);
        s.phase = Some(resting_phase);
        s.last_transition_time = Some(time::from_chrono(now));
        recovery::reset_retry_state(s);
    })
    .await?;
    println!(
        "{}",
        format!(
            "✅ plan {:?} finished {} (cycle {})",
            plan.name_any(),
            operation,
            status.current_cycle_id.as_deref().unwrap_or("?")
        )
        .green()
    );

    if operation == Operation::Wakeup
        && let Err(e) = cleanup_after_wake_up(ctx, &plan).await
    {
        // Cleanup failures are logged and retried on a later pass.
        eprintln!(
            "{}",
            format!("post-wake cleanup for {:?} failed: {}", plan.name_any(), e).yellow()
        );
    }
    Ok(Action::requeue(REQUEUE_ON_EXECUTION))
}

/// After a completed wake-up: once every target reports restored, unlock
/// the restore data and drop the suspension stash.
pub async fn cleanup_after_wake_up(ctx: &ContextData, plan: &HibernatePlan) -> Result<(), Error> {
    let namespace = plan.namespace().unwrap_or_default();
    let targets: Vec<String> = plan.spec.targets.iter().map(|t| t.name.clone()).collect();
    if !ctx
        .restore
        .mark_all_targets_restored(&namespace, plan, &targets)
        .await?
    {
        return Ok(());
    }
    ctx.restore.unlock_restore_data(&namespace, plan).await?;
    if plan
        .annotations()
        .contains_key(annotations::SUSPENDED_AT_PHASE)
    {
        patch_object(ctx.client.clone(), plan, |p| {
            if let Some(existing) = p.metadata.annotations.as_mut() {
                existing.remove(annotations::SUSPENDED_AT_PHASE);
            }
        })
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn execution(target: &str, state: ExecutionState) -> ExecutionStatus {
        ExecutionStatus {
            target: target.to_string(),
            executor: "eks".to_string(),
            state,
            ..Default::default()
        }
    }

    fn runner_job(target: &str, condition: Option<(&str, &str)>, stale: bool) -> Job {
        let mut job_labels = BTreeMap::new();
        job_labels.insert(labels::TARGET.to_string(), target.to_string());
        job_labels.insert(labels::EXECUTOR.to_string(), "eks".to_string());
        job_labels.insert(
            labels::EXECUTION_ID.to_string(),
            format!("nightly-{target}-1769641200"),
        );
        if stale {
            job_labels.insert(labels::STALE.to_string(), "true".to_string());
        }
        Job {
            metadata: ObjectMeta {
                name: Some(format!("runner-nightly-{target}-abcde")),
                labels: Some(job_labels),
                ..Default::default()
            },
            status: condition.map(|(type_, status)| JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dep(from: &str, to: &str) -> Dependency {
        Dependency {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn stage_status_counts_each_state() {
        let executions = vec![
            execution("a", ExecutionState::Completed),
            execution("b", ExecutionState::Running),
            execution("c", ExecutionState::Failed),
        ];
        let targets: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let status = stage_status(&targets, &executions);
        assert!(!status.all_terminal);
        assert!(status.has_running);
        assert!(!status.has_pending);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
    }

    #[test]
    fn absent_execution_entry_counts_as_pending() {
        let targets = vec!["ghost".to_string()];
        let status = stage_status(&targets, &[]);
        assert!(status.has_pending);
        assert!(!status.all_terminal);
    }

    #[test]
    fn terminal_stage_is_all_terminal() {
        let executions = vec![
            execution("a", ExecutionState::Completed),
            execution("b", ExecutionState::Failed),
        ];
        let targets: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let status = stage_status(&targets, &executions);
        assert!(status.all_terminal);
        assert_eq!(status.failed, 1);
        assert_eq!(status.completed, 1);
    }

    #[test]
    fn stale_jobs_are_invisible_to_lookup() {
        let jobs = vec![runner_job("db", Some(("Failed", "True")), true)];
        assert!(find_job_for(&jobs, "db", "eks").is_none());
        let jobs = vec![
            runner_job("db", Some(("Failed", "True")), true),
            runner_job("db", None, false),
        ];
        let found = find_job_for(&jobs, "db", "eks").unwrap();
        assert!(!jobs::is_stale(found));
    }

    #[test]
    fn refresh_picks_up_completion() {
        let entry = execution("db", ExecutionState::Running);
        let job = runner_job("db", Some(("Complete", "True")), false);
        let updated = refresh_execution_entry(&entry, Some(&job), "hibernate-restore-nightly");
        assert_eq!(updated.state, ExecutionState::Completed);
        assert_eq!(
            updated.logs_ref.as_deref(),
            Some("execution-id=nightly-db-1769641200")
        );
        assert_eq!(
            updated.restore_config_map_ref.as_deref(),
            Some("hibernate-restore-nightly")
        );
        assert_eq!(
            updated.job_ref.as_deref(),
            Some("runner-nightly-db-abcde")
        );
    }

    #[test]
    fn refresh_infers_completion_after_job_gc() {
        let mut entry = execution("db", ExecutionState::Running);
        entry.finished_at = Some(time::from_chrono(time::now_chrono()));
        let updated = refresh_execution_entry(&entry, None, "cm");
        assert_eq!(updated.state, ExecutionState::Completed);

        // Without a recorded finish the entry is left alone.
        let entry = execution("db", ExecutionState::Running);
        let updated = refresh_execution_entry(&entry, None, "cm");
        assert_eq!(updated.state, ExecutionState::Running);
    }

    #[test]
    fn failed_upstream_follows_the_walk_direction() {
        let deps = vec![dep("a", "b")];
        let executions = vec![
            execution("a", ExecutionState::Failed),
            execution("b", ExecutionState::Pending),
        ];
        assert_eq!(
            failed_upstream("b", &deps, Operation::Shutdown, &executions),
            Some("a")
        );
        assert_eq!(failed_upstream("b", &deps, Operation::Wakeup, &executions), None);

        let executions = vec![
            execution("a", ExecutionState::Pending),
            execution("b", ExecutionState::Failed),
        ];
        assert_eq!(
            failed_upstream("a", &deps, Operation::Wakeup, &executions),
            Some("b")
        );
        assert_eq!(failed_upstream("a", &deps, Operation::Shutdown, &executions), None);
    }

    #[test]
    fn operation_complete_requires_all_terminal() {
        assert!(is_operation_complete(&[
            execution("a", ExecutionState::Completed),
            execution("b", ExecutionState::Failed),
        ]));
        assert!(!is_operation_complete(&[
            execution("a", ExecutionState::Completed),
            execution("b", ExecutionState::Running),
        ]));
        assert!(is_operation_complete(&[]));
    }
}
