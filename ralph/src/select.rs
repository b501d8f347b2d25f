//! Selection helpers for `ralph select` and the control loop.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::selector::{is_complete, next_task};
use crate::core::types::Plan;
use crate::io::plan_store::load_plan;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every task is done or skipped.
    Complete,
    /// Next eligible task id.
    Open(String),
    /// Nothing is eligible but the plan is not complete.
    Blocked(Vec<String>),
}

/// Select the next task from an in-memory plan.
pub fn select_task(plan: &Plan) -> SelectOutcome {
    if let Some(task) = next_task(plan) {
        return SelectOutcome::Open(task.id.clone());
    }
    if is_complete(plan) {
        return SelectOutcome::Complete;
    }
    SelectOutcome::Blocked(
        plan.tasks
            .iter()
            .filter(|task| !task.status.is_settled())
            .map(|task| task.id.clone())
            .collect(),
    )
}

/// Load the plan from disk and select the next task.
pub fn select_from_path(plan_path: &Path) -> Result<SelectOutcome> {
    let plan = load_plan(plan_path).with_context(|| "load plan for selection")?;
    Ok(select_task(&plan))
}
