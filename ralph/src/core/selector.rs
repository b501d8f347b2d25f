//! Deterministic task selection for the plan.

use crate::core::types::{Plan, Task, TaskStatus};

/// Return the first pending task (in plan order) whose dependencies are all done.
///
/// Unknown dependency ids are never satisfied.
pub fn next_task(plan: &Plan) -> Option<&Task> {
    plan.tasks
        .iter()
        .find(|task| task.status == TaskStatus::Pending && dependencies_done(plan, task))
}

/// True when every task is `done` or `skipped`.
pub fn is_complete(plan: &Plan) -> bool {
    plan.tasks.iter().all(|task| task.status.is_settled())
}

/// Pending tasks that cannot run because a dependency is not done.
///
/// Returned as `(task_id, unmet dependency ids)` in plan order.
pub fn blocked_tasks(plan: &Plan) -> Vec<(String, Vec<String>)> {
    plan.tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter_map(|task| {
            let unmet = unmet_dependencies(plan, task);
            (!unmet.is_empty()).then(|| (task.id.clone(), unmet))
        })
        .collect()
}

fn dependencies_done(plan: &Plan, task: &Task) -> bool {
    task.depends_on.iter().all(|dep| {
        plan.task(dep)
            .is_some_and(|found| found.status == TaskStatus::Done)
    })
}

fn unmet_dependencies(plan: &Plan, task: &Task) -> Vec<String> {
    task.depends_on
        .iter()
        .filter(|dep| {
            !plan
                .task(dep)
                .is_some_and(|found| found.status == TaskStatus::Done)
        })
        .cloned()
        .collect()
}
