//! Cycle bookkeeping: projecting per-target execution records into the
//! rolling history kept on plan status.

use hibernator_types::{
    ExecutionCycle, ExecutionState, ExecutionStatus, ExecutionSummary, Operation,
    TargetExecutionResult,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// The history ring buffer keeps the five most recent cycles.
pub const HISTORY_LIMIT: usize = 5;

pub fn build_target_results(executions: &[ExecutionStatus]) -> Vec<TargetExecutionResult> {
    executions
        .iter()
        .map(|e| TargetExecutionResult {
            target: e.target.clone(),
            success: e.state == ExecutionState::Completed,
            message: e.message.clone(),
        })
        .collect()
}

/// Summary of the operation that just finished. Success means no target
/// failed; start/end are the earliest start and latest finish observed.
pub fn build_summary(
    operation: Operation,
    executions: &[ExecutionStatus],
    fallback_end: Time,
) -> ExecutionSummary {
    let target_results = build_target_results(executions);
    let success = executions.iter().all(|e| e.state != ExecutionState::Failed);
    let start_time = executions
        .iter()
        .filter_map(|e| e.started_at.clone())
        .min_by(|a, b| a.0.cmp(&b.0));
    let end_time = executions
        .iter()
        .filter_map(|e| e.finished_at.clone())
        .max_by(|a, b| a.0.cmp(&b.0))
        .or(Some(fallback_end));
    ExecutionSummary {
        operation,
        start_time,
        end_time,
        success,
        target_results,
    }
}

/// Attaches a finished operation summary to its cycle, appending the cycle
/// if this is its first summary. Idempotent: an already-set summary is left
/// alone. Overflow truncates the oldest cycles from the head.
pub fn record_cycle_summary(
    history: &mut Vec<ExecutionCycle>,
    cycle_id: &str,
    summary: ExecutionSummary,
) {
    let cycle = match history.iter_mut().find(|c| c.cycle_id == cycle_id) {
        Some(cycle) => cycle,
        None => {
            history.push(ExecutionCycle {
                cycle_id: cycle_id.to_string(),
                shutdown_execution: None,
                wakeup_execution: None,
            });
            history.last_mut().unwrap()
        }
    };
    let slot = match summary.operation {
        Operation::Shutdown => &mut cycle.shutdown_execution,
        Operation::Wakeup => &mut cycle.wakeup_execution,
    };
    if slot.is_none() {
        *slot = Some(summary);
    }
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}
