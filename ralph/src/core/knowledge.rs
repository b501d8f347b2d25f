//! Knowledge-index invariants checked after every consolidation.
//!
//! The index has two forms: a categorized markdown document and an
//! append-only JSON array of [`KnowledgeEntry`] records. A consolidation is
//! accepted only if all of the following hold:
//!
//! 1. The markdown keeps the `# Knowledge Index` header and a parseable
//!    `last updated at iteration N` line.
//! 2. Every previous hard-constraint line survives verbatim, or its id is
//!    superseded explicitly (a `[supersedes: ID]` marker in the markdown or a
//!    JSON entry listing the id in `supersedes`).
//! 3. The JSON array is append-only: previous entries reappear unchanged and
//!    in order, and no two entries share an `iteration`.
//! 4. No memory id is claimed by two active entries, and every `supersedes`
//!    id names a memory id that exists.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::{EntryStatus, KnowledgeEntry};

pub const INDEX_HEADER: &str = "# Knowledge Index";

static LAST_UPDATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)last updated at iteration\s+(\d+)").expect("valid last-updated regex")
});
static CONSTRAINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(must|never)\b").expect("valid constraint regex"));
static MEMORY_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Za-z][\w.]*-[\w.-]+)\]").expect("valid memory id regex")
});
static SUPERSEDES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[supersedes:\s*([A-Za-z][\w.]*-[\w.-]+)\s*\]")
        .expect("valid supersedes regex")
});

/// Parse the `last updated at iteration N` marker.
pub fn last_updated_iteration(markdown: &str) -> Option<u64> {
    LAST_UPDATED_RE
        .captures(markdown)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Lines that state a hard constraint ("must", "must not", "never").
pub fn hard_constraints(markdown: &str) -> Vec<&str> {
    markdown
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| CONSTRAINT_RE.is_match(line))
        .collect()
}

/// Memory id tagged on a line, e.g. `- [K-003] Never force-push`.
pub fn line_memory_id(line: &str) -> Option<&str> {
    MEMORY_ID_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Verify a consolidation from `(before_md, before_json)` to `(after_md, after_json)`.
///
/// Returns human-readable violations; an empty list means the update is accepted.
pub fn verify_knowledge_update(
    before_md: &str,
    before_json: &str,
    after_md: &str,
    after_json: &str,
) -> Vec<String> {
    let mut errors = Vec::new();

    check_document_shape(after_md, &mut errors);

    let before_entries = match parse_entries(before_json) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push(format!("previous knowledge index json: {err}"));
            return errors;
        }
    };
    let after_entries = match parse_entries(after_json) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push(format!("knowledge index json: {err}"));
            return errors;
        }
    };

    let typed: Vec<KnowledgeEntry> = after_entries
        .iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value(value.clone()) {
            Ok(entry) => Some(entry),
            Err(err) => {
                errors.push(format!("entry {i} is malformed: {err}"));
                None
            }
        })
        .collect();

    check_constraints_preserved(before_md, after_md, &typed, &mut errors);
    check_append_only(&before_entries, &after_entries, &mut errors);
    check_memory_ids(&typed, &mut errors);

    errors
}

fn check_document_shape(markdown: &str, errors: &mut Vec<String>) {
    let has_header = markdown.lines().any(|line| line.trim() == INDEX_HEADER);
    if !has_header {
        errors.push(format!("missing '{INDEX_HEADER}' header"));
    }
    if last_updated_iteration(markdown).is_none() {
        errors.push("missing 'last updated at iteration N' line".to_string());
    }
}

fn check_constraints_preserved(
    before_md: &str,
    after_md: &str,
    after_entries: &[KnowledgeEntry],
    errors: &mut Vec<String>,
) {
    let surviving: BTreeSet<&str> = after_md.lines().map(str::trim).collect();
    let superseded: BTreeSet<&str> = SUPERSEDES_RE
        .captures_iter(after_md)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .chain(
            after_entries
                .iter()
                .flat_map(|entry| entry.supersedes.iter().map(String::as_str)),
        )
        .collect();

    for line in hard_constraints(before_md) {
        if surviving.contains(line) {
            continue;
        }
        match line_memory_id(line) {
            Some(id) if superseded.contains(id) => {}
            Some(id) => errors.push(format!(
                "constraint [{id}] removed without supersession: {line}"
            )),
            None => errors.push(format!("constraint removed: {line}")),
        }
    }
}

fn check_append_only(before: &[Value], after: &[Value], errors: &mut Vec<String>) {
    if after.len() < before.len() {
        errors.push(format!(
            "knowledge index shrank from {} to {} entries",
            before.len(),
            after.len()
        ));
    }
    for (i, (old, new)) in before.iter().zip(after).enumerate() {
        if canonical(old) != canonical(new) {
            errors.push(format!("entry {i} was rewritten"));
        }
    }

    let mut seen = BTreeSet::new();
    for value in after {
        if let Some(iteration) = value.get("iteration").and_then(Value::as_u64)
            && !seen.insert(iteration)
        {
            errors.push(format!("duplicate iteration key {iteration}"));
        }
    }
}

fn check_memory_ids(entries: &[KnowledgeEntry], errors: &mut Vec<String>) {
    let mut active: BTreeMap<&str, usize> = BTreeMap::new();
    let mut known = BTreeSet::new();
    for entry in entries {
        for id in &entry.memory_ids {
            known.insert(id.as_str());
            if entry.status == EntryStatus::Active {
                *active.entry(id.as_str()).or_default() += 1;
            }
        }
    }

    for (id, count) in active {
        if count > 1 {
            errors.push(format!("memory id {id} is active in {count} entries"));
        }
    }
    for entry in entries {
        for id in &entry.supersedes {
            if !known.contains(id.as_str()) {
                errors.push(format!("supersedes unknown memory id {id}"));
            }
        }
    }
}

fn parse_entries(raw: &str) -> Result<Vec<Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(raw).map_err(|err| format!("parse error: {err}"))?;
    match value {
        Value::Array(entries) => Ok(entries),
        _ => Err("expected a json array".to_string()),
    }
}

/// Key-sorted compact serialization used for byte-for-byte entry comparison.
fn canonical(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const BEFORE_MD: &str = "# Knowledge Index\n\nLast updated at iteration 3\n\n## Constraints\n- [K-001] We must never force-push to main.\n\n## Patterns\n- Prefer small commits.\n";

    fn entries(n: u64) -> Vec<Value> {
        (1..=n)
            .map(|i| {
                json!({
                    "iteration": i,
                    "memory_ids": [format!("K-00{i}")],
                    "status": "active",
                    "supersedes": [],
                    "summary": format!("entry {i}"),
                })
            })
            .collect()
    }

    fn as_json(values: &[Value]) -> String {
        serde_json::to_string_pretty(values).expect("serialize")
    }

    fn after_md() -> String {
        BEFORE_MD.replace("iteration 3", "iteration 4")
    }

    #[test]
    fn appending_one_entry_passes() {
        let before = entries(3);
        let mut after = before.clone();
        after.push(json!({
            "iteration": 4,
            "memory_ids": ["K-004"],
            "status": "active",
            "supersedes": []
        }));
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &after_md(), &as_json(&after));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn removing_prior_entry_fails() {
        let before = entries(3);
        let after = before[1..].to_vec();
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &after_md(), &as_json(&after));
        assert!(errors.iter().any(|err| err.contains("shrank")));
    }

    #[test]
    fn mutating_prior_entry_fails() {
        let before = entries(3);
        let mut after = before.clone();
        after[1]["summary"] = json!("rewritten");
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &after_md(), &as_json(&after));
        assert_eq!(errors, vec!["entry 1 was rewritten".to_string()]);
    }

    #[test]
    fn reformatting_prior_entries_is_not_a_rewrite() {
        let before = entries(3);
        let compact = serde_json::to_string(&before).expect("serialize");
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &after_md(), &compact);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn dropping_constraint_without_supersession_fails() {
        let json = as_json(&entries(3));
        let dropped = after_md().replace("- [K-001] We must never force-push to main.\n", "");
        let errors = verify_knowledge_update(BEFORE_MD, &json, &dropped, &json);
        assert!(errors.iter().any(|err| err.contains("[K-001]")));
    }

    #[test]
    fn dropping_constraint_with_supersession_entry_passes() {
        let before = entries(3);
        let mut after = before.clone();
        after.push(json!({
            "iteration": 4,
            "memory_ids": ["K-010"],
            "status": "active",
            "supersedes": ["K-001"]
        }));
        let dropped = after_md().replace(
            "- [K-001] We must never force-push to main.",
            "- [K-010] Force-push is allowed on release branches only.",
        );
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &dropped, &as_json(&after));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn inline_supersession_marker_is_accepted() {
        let json = as_json(&entries(3));
        let dropped = after_md().replace(
            "- [K-001] We must never force-push to main.",
            "- [K-009] Force-push needs review. [supersedes: K-001]",
        );
        let errors = verify_knowledge_update(BEFORE_MD, &json, &dropped, &json);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn missing_header_and_marker_are_reported() {
        let json = as_json(&entries(1));
        let errors = verify_knowledge_update(BEFORE_MD, &json, "just text\n", &json);
        assert!(errors.iter().any(|err| err.contains("header")));
        assert!(errors.iter().any(|err| err.contains("last updated")));
    }

    #[test]
    fn duplicate_iterations_and_active_ids_are_reported() {
        let before = entries(1);
        let mut after = before.clone();
        after.push(json!({
            "iteration": 1,
            "memory_ids": ["K-001"],
            "status": "active",
            "supersedes": ["K-404"]
        }));
        let errors =
            verify_knowledge_update(BEFORE_MD, &as_json(&before), &after_md(), &as_json(&after));
        assert!(
            errors
                .iter()
                .any(|err| err.contains("duplicate iteration key 1"))
        );
        assert!(
            errors
                .iter()
                .any(|err| err.contains("K-001 is active in 2"))
        );
        assert!(
            errors
                .iter()
                .any(|err| err.contains("unknown memory id K-404"))
        );
    }
}
