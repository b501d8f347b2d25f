//! Bundled JSON Schemas and validation against them.

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub const HANDOFF_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/handoff/v1.schema.json"
));
pub const KNOWLEDGE_SUMMARY_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/knowledge_summary/v1.schema.json"
));
pub const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/plan/v1.schema.json"
));

/// Validate `value` against `schema`, collecting every error into one message.
pub fn validate_value(schema: &str, value: &Value, label: &str) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(schema).with_context(|| format!("parse {label} schema"))?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid {label} schema: {err}"))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{label} schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Parse `text` as JSON, validate it against `schema`, then deserialize.
pub fn parse_validated<T: DeserializeOwned>(schema: &str, text: &str, label: &str) -> Result<T> {
    let value: Value = serde_json::from_str(text).with_context(|| format!("parse {label}"))?;
    validate_value(schema, &value, label)?;
    serde_json::from_value(value).with_context(|| format!("deserialize {label}"))
}

/// Schema text with insignificant whitespace removed, for passing on a command line.
pub fn compact(schema: &str) -> Result<String> {
    let value: Value = serde_json::from_str(schema).context("parse schema")?;
    serde_json::to_string(&value).context("serialize schema")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Handoff, KnowledgeSummary, Plan};

    #[test]
    fn bundled_schemas_compile() {
        for schema in [HANDOFF_SCHEMA, KNOWLEDGE_SUMMARY_SCHEMA, PLAN_SCHEMA] {
            let value: Value = serde_json::from_str(schema).expect("parse");
            validator_for(&value).expect("compile");
        }
    }

    #[test]
    fn handoff_requires_task_completed() {
        let err = parse_validated::<Handoff>(HANDOFF_SCHEMA, r#"{"summary":"did it"}"#, "handoff")
            .unwrap_err();
        assert!(err.to_string().contains("handoff schema validation failed"));
    }

    #[test]
    fn minimal_handoff_parses() {
        let handoff: Handoff = parse_validated(
            HANDOFF_SCHEMA,
            r#"{"summary":"did it","task_completed":{"task_id":"a","fully_complete":true}}"#,
            "handoff",
        )
        .expect("parse");
        assert_eq!(handoff.task_completed.task_id, "a");
        assert!(handoff.plan_amendments.is_empty());
    }

    #[test]
    fn plan_rejects_unknown_status() {
        let text = r#"{"tasks":[{"id":"a","title":"A","description":"d","status":"halfway"}]}"#;
        assert!(parse_validated::<Plan>(PLAN_SCHEMA, text, "plan").is_err());
    }

    #[test]
    fn knowledge_summary_parses() {
        let summary: KnowledgeSummary = parse_validated(
            KNOWLEDGE_SUMMARY_SCHEMA,
            r#"{"summary":"s","new_memory_ids":["K-001"]}"#,
            "knowledge summary",
        )
        .expect("parse");
        assert_eq!(summary.new_memory_ids, vec!["K-001".to_string()]);
    }

    #[test]
    fn compact_strips_whitespace() {
        let compacted = compact(KNOWLEDGE_SUMMARY_SCHEMA).expect("compact");
        assert!(!compacted.contains('\n'));
    }
}
