//! Orchestrator-owned task status and retry transitions.

use crate::core::types::{Plan, TaskStatus};

/// How an attempt at a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Validation passed and the attempt was committed.
    Passed,
    /// Agent or validation failure; the attempt was rolled back.
    Failed,
    /// The operator interrupted the run; the attempt does not count.
    Interrupted,
}

/// Record of a single status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub retry_count: u32,
}

/// Mark the selected task `in_progress`. Only pending tasks may start.
pub fn begin_attempt(plan: &mut Plan, task_id: &str) -> Result<Transition, String> {
    let task = plan
        .task_mut(task_id)
        .ok_or_else(|| format!("task '{}' not found", task_id))?;
    if task.status != TaskStatus::Pending {
        return Err(format!(
            "task '{}' is {} and cannot start",
            task_id,
            task.status.as_str()
        ));
    }
    task.status = TaskStatus::InProgress;
    Ok(Transition {
        task_id: task_id.to_string(),
        from: TaskStatus::Pending,
        to: TaskStatus::InProgress,
        retry_count: task.retry_count,
    })
}

/// Apply the outcome of an attempt to an `in_progress` task.
///
/// A failure consumes one retry; the task returns to `pending` while retries
/// remain and becomes `failed` once `retry_count >= max_retries`.
pub fn record_outcome(
    plan: &mut Plan,
    task_id: &str,
    outcome: AttemptOutcome,
) -> Result<Transition, String> {
    let task = plan
        .task_mut(task_id)
        .ok_or_else(|| format!("task '{}' not found", task_id))?;
    if task.status != TaskStatus::InProgress {
        return Err(format!(
            "task '{}' is {}, expected in_progress",
            task_id,
            task.status.as_str()
        ));
    }
    let from = task.status;
    task.status = match outcome {
        AttemptOutcome::Passed => TaskStatus::Done,
        AttemptOutcome::Interrupted => TaskStatus::Pending,
        AttemptOutcome::Failed => {
            task.retry_count = (task.retry_count + 1).min(task.max_retries);
            if task.retry_count >= task.max_retries {
                TaskStatus::Failed
            } else {
                TaskStatus::Pending
            }
        }
    };
    Ok(Transition {
        task_id: task_id.to_string(),
        from,
        to: task.status,
        retry_count: task.retry_count,
    })
}

/// Operator override: move any non-done task to `skipped`.
pub fn skip_task(plan: &mut Plan, task_id: &str) -> Result<Transition, String> {
    let task = plan
        .task_mut(task_id)
        .ok_or_else(|| format!("task '{}' not found", task_id))?;
    if task.status == TaskStatus::Done {
        return Err(format!("task '{}' is done and cannot be skipped", task_id));
    }
    let from = task.status;
    task.status = TaskStatus::Skipped;
    Ok(Transition {
        task_id: task_id.to_string(),
        from,
        to: TaskStatus::Skipped,
        retry_count: task.retry_count,
    })
}

/// Return tasks left `in_progress` by an earlier crash to `pending`.
///
/// Returns the ids that were reset, in plan order.
pub fn recover_in_progress(plan: &mut Plan) -> Vec<String> {
    let mut reset = Vec::new();
    for task in &mut plan.tasks {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
            reset.push(task.id.clone());
        }
    }
    reset
}
