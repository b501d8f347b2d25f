//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::core::amendments::{AmendmentDecision, AmendmentReport};
use crate::core::invariants::validate_plan_invariants;
use crate::core::types::Plan;
use crate::io::files::{append_jsonl, write_json_atomic};
use crate::io::run_state::now_rfc3339;
use crate::io::schema::{PLAN_SCHEMA, parse_validated};

/// Load and validate the plan from disk (schema + invariants).
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan: Plan = parse_validated(PLAN_SCHEMA, &contents, "plan")
        .with_context(|| format!("load plan {}", path.display()))?;
    validate_invariants(&plan)?;
    debug!(tasks = plan.tasks.len(), "plan loaded");
    Ok(plan)
}

/// Atomically write the plan after re-checking invariants.
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    validate_invariants(plan)?;
    write_json_atomic(path, plan).with_context(|| format!("write plan {}", path.display()))
}

/// Copy of the plan taken before amendments mutate it.
pub fn snapshot_plan(path: &Path, plan: &Plan) -> Result<()> {
    write_json_atomic(path, plan).with_context(|| format!("snapshot plan {}", path.display()))
}

fn validate_invariants(plan: &Plan) -> Result<()> {
    let errors = validate_plan_invariants(plan);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("plan invariants failed: {}", errors.join("; ")))
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    iteration: u32,
    current_task_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_rejected: Option<&'a str>,
    #[serde(flatten)]
    decision: Option<&'a AmendmentDecision>,
}

/// Append one audit line per decision (or one line for a rejected batch).
pub fn append_amendment_audit(
    path: &Path,
    iteration: u32,
    task_id: &str,
    report: &AmendmentReport,
) -> Result<()> {
    let timestamp = now_rfc3339();
    if let Some(reason) = report.batch_rejected.as_deref() {
        return append_jsonl(
            path,
            &AuditRecord {
                timestamp,
                iteration,
                current_task_id: task_id,
                batch_rejected: Some(reason),
                decision: None,
            },
        );
    }
    for decision in &report.decisions {
        append_jsonl(
            path,
            &AuditRecord {
                timestamp: timestamp.clone(),
                iteration,
                current_task_id: task_id,
                batch_rejected: None,
                decision: Some(decision),
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amendments::apply_amendments;
    use crate::core::types::{AmendmentAction, Handoff, PlanAmendment, TaskStatus};
    use crate::test_support::{plan_of, task, task_with_deps};

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let plan = plan_of(vec![task("a"), task_with_deps("b", &["a"])]);
        write_plan(&path, &plan).expect("write");
        assert_eq!(load_plan(&path).expect("load"), plan);
    }

    #[test]
    fn load_rejects_unknown_dependency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(
            &path,
            r#"{"tasks":[{"id":"a","title":"A","description":"d","depends_on":["ghost"]}]}"#,
        )
        .expect("write");
        let err = load_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown dependency 'ghost'"));
    }

    #[test]
    fn load_rejects_schema_violation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, r#"{"tasks":[{"id":"a"}]}"#).expect("write");
        let err = load_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("plan schema validation failed"));
    }

    #[test]
    fn load_defaults_optional_task_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(
            &path,
            r#"{"project":"demo","tasks":[{"id":"a","title":"A","description":"d"}]}"#,
        )
        .expect("write");
        let plan = load_plan(&path).expect("load");
        assert_eq!(plan.project.as_deref(), Some("demo"));
        assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
        assert_eq!(plan.tasks[0].max_retries, 3);
    }

    #[test]
    fn audit_writes_one_line_per_decision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("amendments.jsonl");
        let mut plan = plan_of(vec![task("a"), task("b")]);
        plan.tasks[0].status = TaskStatus::InProgress;
        let handoff = Handoff {
            plan_amendments: vec![
                PlanAmendment {
                    action: AmendmentAction::Remove,
                    task_id: Some("b".to_string()),
                    task: None,
                    changes: None,
                    reason: "obsolete".to_string(),
                    after: None,
                },
                PlanAmendment {
                    action: AmendmentAction::Remove,
                    task_id: Some("ghost".to_string()),
                    task: None,
                    changes: None,
                    reason: String::new(),
                    after: None,
                },
            ],
            ..Handoff::default()
        };
        let report = apply_amendments(&mut plan, &handoff, "a");
        append_amendment_audit(&path, 2, "a", &report).expect("audit");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["accepted"], true);
        assert_eq!(lines[1]["accepted"], false);
        assert_eq!(lines[1]["iteration"], 2);
    }
}
