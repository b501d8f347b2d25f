//! Semantic plan invariants not expressible via JSON Schema.

use std::collections::{HashMap, HashSet};

use crate::core::types::Plan;

/// Check semantic invariants of a plan:
/// - No duplicate ids
/// - `depends_on` only names known tasks, never the task itself
/// - no dependency cycles
/// - `max_retries > 0`
/// - `retry_count <= max_retries`
pub fn validate_plan_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let ids: HashSet<&str> = plan.tasks.iter().map(|task| task.id.as_str()).collect();

    for task in &plan.tasks {
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate id '{}'", task.id));
        }
        if task.max_retries == 0 {
            errors.push(format!("{}: max_retries must be > 0", task.id));
        }
        if task.retry_count > task.max_retries {
            errors.push(format!(
                "{}: retry_count {} exceeds max_retries {}",
                task.id, task.retry_count, task.max_retries
            ));
        }
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(format!("{}: depends on itself", task.id));
            } else if !ids.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", task.id, dep));
            }
        }
    }
    if let Some(cycle) = find_cycle(plan) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Finished,
}

/// First dependency cycle found, as a path that starts and ends on the same
/// id. Self-dependencies and unknown ids are left to the checks above.
pub fn find_cycle(plan: &Plan) -> Option<Vec<String>> {
    let deps: HashMap<&str, Vec<&str>> = plan
        .tasks
        .iter()
        .map(|task| {
            let edges = task
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| *dep != task.id)
                .collect();
            (task.id.as_str(), edges)
        })
        .collect();
    let mut visits: HashMap<&str, Visit> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    for task in &plan.tasks {
        if let Some(cycle) = visit(task.id.as_str(), &deps, &mut visits, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    visits: &mut HashMap<&'a str, Visit>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match visits.get(id) {
        Some(Visit::Finished) => return None,
        Some(Visit::InProgress) => {
            let start = path.iter().position(|seen| *seen == id).unwrap_or(0);
            let mut cycle: Vec<String> =
                path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        None => {}
    }
    let edges = deps.get(id)?;
    visits.insert(id, Visit::InProgress);
    path.push(id);
    for dep in edges {
        if let Some(cycle) = visit(*dep, deps, visits, path) {
            return Some(cycle);
        }
    }
    path.pop();
    visits.insert(id, Visit::Finished);
    None
}
