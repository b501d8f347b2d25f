//! Guarded application of agent-proposed plan amendments.
//!
//! The agent is untrusted: every amendment is checked against the guardrails
//! below and every accept/reject decision is reported with a reason so the
//! caller can append it to the audit log.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::invariants::find_cycle;
use crate::core::types::{
    AmendmentAction, DEFAULT_MAX_RETRIES, Handoff, Plan, PlanAmendment, Task, TaskStatus,
};

/// Largest amendment batch accepted from a single handoff.
pub const MAX_AMENDMENTS_PER_BATCH: usize = 3;

/// Fields the orchestrator owns and the agent may never set through `modify`.
const ORCHESTRATOR_OWNED: &[&str] = &["retry_count"];

/// Accept/reject decision for one amendment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmendmentDecision {
    pub index: usize,
    pub action: AmendmentAction,
    pub task_id: Option<String>,
    pub accepted: bool,
    /// Why the orchestrator accepted or rejected it.
    pub decision: String,
    /// Reason the agent gave for proposing it.
    pub proposed_reason: String,
}

/// Outcome of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AmendmentReport {
    /// Set when the whole batch was rejected without evaluating entries.
    pub batch_rejected: Option<String>,
    pub decisions: Vec<AmendmentDecision>,
}

impl AmendmentReport {
    pub fn accepted(&self) -> usize {
        self.decisions.iter().filter(|d| d.accepted).count()
    }

    pub fn rejected(&self) -> usize {
        self.decisions.len() - self.accepted()
    }
}

/// True when a batch may be applied (and the plan should be snapshotted first).
pub fn batch_within_limit(amendments: &[PlanAmendment]) -> bool {
    !amendments.is_empty() && amendments.len() <= MAX_AMENDMENTS_PER_BATCH
}

/// Apply the amendments proposed in `handoff` to `plan`.
///
/// `current_task_id` is the task being executed; it must still be
/// `in_progress` so status edits to it can be recognized and refused.
pub fn apply_amendments(
    plan: &mut Plan,
    handoff: &Handoff,
    current_task_id: &str,
) -> AmendmentReport {
    let amendments = &handoff.plan_amendments;
    if amendments.len() > MAX_AMENDMENTS_PER_BATCH {
        return AmendmentReport {
            batch_rejected: Some(format!(
                "batch of {} amendments exceeds limit of {}",
                amendments.len(),
                MAX_AMENDMENTS_PER_BATCH
            )),
            decisions: Vec::new(),
        };
    }

    let decisions = amendments
        .iter()
        .enumerate()
        .map(|(index, amendment)| {
            let result = match amendment.action {
                AmendmentAction::Add => apply_add(plan, amendment),
                AmendmentAction::Modify => apply_modify(plan, amendment, current_task_id),
                AmendmentAction::Remove => apply_remove(plan, amendment, current_task_id),
            };
            let (accepted, decision) = match result {
                Ok(msg) => (true, msg),
                Err(msg) => (false, msg),
            };
            AmendmentDecision {
                index,
                action: amendment.action,
                task_id: amendment.target_id().map(str::to_string),
                accepted,
                decision,
                proposed_reason: amendment.reason.clone(),
            }
        })
        .collect();

    AmendmentReport {
        batch_rejected: None,
        decisions,
    }
}

fn apply_add(plan: &mut Plan, amendment: &PlanAmendment) -> Result<String, String> {
    let body = amendment
        .task
        .as_ref()
        .and_then(Value::as_object)
        .ok_or("add requires a task object")?;
    for field in ["id", "title", "description"] {
        let present = body
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|value| !value.trim().is_empty());
        if !present {
            return Err(format!("add requires non-empty '{field}'"));
        }
    }

    let mut task: Task = serde_json::from_value(Value::Object(body.clone()))
        .map_err(|err| format!("add has malformed task: {err}"))?;
    if plan.task(&task.id).is_some() {
        return Err(format!("task '{}' already exists", task.id));
    }
    check_dependencies(plan, &task)?;
    check_acyclic(plan, &task)?;

    task.status = TaskStatus::Pending;
    task.retry_count = 0;
    if task.max_retries == 0 {
        task.max_retries = DEFAULT_MAX_RETRIES;
    }

    let id = task.id.clone();
    let anchor = amendment.after.as_deref();
    match anchor.and_then(|after| plan.position(after)) {
        Some(pos) => {
            plan.tasks.insert(pos + 1, task);
            Ok(format!("added '{id}' after '{}'", plan.tasks[pos].id))
        }
        None => {
            plan.tasks.push(task);
            Ok(format!("added '{id}' at end of plan"))
        }
    }
}

fn apply_modify(
    plan: &mut Plan,
    amendment: &PlanAmendment,
    current_task_id: &str,
) -> Result<String, String> {
    let id = amendment
        .target_id()
        .ok_or("modify requires task_id")?
        .to_string();
    let existing = plan
        .task(&id)
        .ok_or_else(|| format!("task '{id}' not found"))?;
    let changes = modify_changes(amendment)?;

    if id == current_task_id && changes.contains_key("status") {
        return Err(format!("cannot change status of executing task '{id}'"));
    }
    if existing.status == TaskStatus::Done {
        return Err(format!("task '{id}' is done and immutable"));
    }
    if let Some(new_id) = changes.get("id")
        && new_id.as_str() != Some(id.as_str())
    {
        return Err(format!("cannot change id of task '{id}'"));
    }
    if let Some(field) = ORCHESTRATOR_OWNED
        .iter()
        .find(|field| changes.contains_key(**field))
    {
        return Err(format!("'{field}' is owned by the orchestrator"));
    }

    let mut merged = serde_json::to_value(existing)
        .map_err(|err| format!("serialize task '{id}': {err}"))?;
    if let Some(object) = merged.as_object_mut() {
        for (key, value) in &changes {
            object.insert(key.clone(), value.clone());
        }
    }
    let updated: Task = serde_json::from_value(merged)
        .map_err(|err| format!("modified task '{id}' is malformed: {err}"))?;
    if changes.contains_key("status")
        && !matches!(updated.status, TaskStatus::Pending | TaskStatus::Skipped)
    {
        return Err(format!(
            "task '{id}': status may only be set to pending or skipped"
        ));
    }
    if updated.max_retries == 0 {
        return Err(format!("task '{id}': max_retries must be > 0"));
    }
    if updated.retry_count > updated.max_retries {
        return Err(format!("task '{id}': max_retries below retry_count"));
    }
    check_dependencies(plan, &updated)?;
    check_acyclic(plan, &updated)?;

    let mut fields: Vec<&str> = changes.keys().map(String::as_str).collect();
    fields.sort_unstable();
    if let Some(slot) = plan.task_mut(&id) {
        *slot = updated;
    }
    Ok(format!("modified '{id}' fields: {}", fields.join(", ")))
}

fn modify_changes(amendment: &PlanAmendment) -> Result<Map<String, Value>, String> {
    let changes = match (&amendment.changes, &amendment.task) {
        (Some(changes), _) => changes.clone(),
        (None, Some(Value::Object(body))) => {
            let mut body = body.clone();
            body.remove("id");
            body
        }
        _ => Map::new(),
    };
    if changes.is_empty() {
        return Err("modify has no changes".to_string());
    }
    Ok(changes)
}

fn apply_remove(
    plan: &mut Plan,
    amendment: &PlanAmendment,
    current_task_id: &str,
) -> Result<String, String> {
    let id = amendment
        .target_id()
        .ok_or("remove requires task_id")?
        .to_string();
    let existing = plan
        .task(&id)
        .ok_or_else(|| format!("task '{id}' not found"))?;
    if existing.status == TaskStatus::Done {
        return Err(format!("task '{id}' is done and cannot be removed"));
    }
    if id == current_task_id {
        return Err(format!("cannot remove executing task '{id}'"));
    }
    let dependents: Vec<&str> = plan
        .tasks
        .iter()
        .filter(|task| task.depends_on.iter().any(|dep| dep == &id))
        .map(|task| task.id.as_str())
        .collect();
    if !dependents.is_empty() {
        return Err(format!(
            "task '{id}' is a dependency of: {}",
            dependents.join(", ")
        ));
    }
    plan.tasks.retain(|task| task.id != id);
    Ok(format!("removed '{id}'"))
}

fn check_dependencies(plan: &Plan, task: &Task) -> Result<(), String> {
    for dep in &task.depends_on {
        if dep == &task.id {
            return Err(format!("task '{}' depends on itself", task.id));
        }
        if plan.task(dep).is_none() {
            return Err(format!("task '{}' depends on unknown '{}'", task.id, dep));
        }
    }
    Ok(())
}

/// Reject `task` (new or replacing the task with its id) if it would close
/// a dependency cycle.
fn check_acyclic(plan: &Plan, task: &Task) -> Result<(), String> {
    let mut candidate = plan.clone();
    match candidate.task_mut(&task.id) {
        Some(slot) => *slot = task.clone(),
        None => candidate.tasks.push(task.clone()),
    }
    match find_cycle(&candidate) {
        Some(cycle) => Err(format!(
            "task '{}' would create dependency cycle {}",
            task.id,
            cycle.join(" -> ")
        )),
        None => Ok(()),
    }
}
