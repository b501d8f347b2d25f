//! Agent abstraction for coding and compaction invocations.
//!
//! The [`Agent`] trait decouples the control loop from the actual agent
//! backend. Tests use scripted agents that return predetermined envelopes
//! without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Handoff, KnowledgeSummary, TaskCompleted};
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::schema::{compact, parse_validated};

/// What the agent is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coding,
    Compaction,
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    /// JSON Schema the structured result must satisfy.
    pub schema: &'static str,
    pub role: AgentRole,
    /// Task being worked on (coding iterations only).
    pub task_id: Option<String>,
    pub iteration: u32,
    pub max_turns: u32,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Where stdout/stderr of the invocation is written.
    pub log_path: PathBuf,
}

/// Response envelope printed by the agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    #[serde(alias = "total_cost_usd")]
    pub cost: f64,
    #[serde(alias = "duration_ms")]
    pub duration: u64,
    pub num_turns: u32,
    pub is_error: bool,
    /// JSON-encoded structured output.
    pub result: Option<String>,
}

/// Abstraction over agent execution backends.
pub trait Agent {
    /// Run the agent. An `Err` means the invocation itself failed.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentEnvelope>;
}

/// Decode the envelope's `result` against `schema` into `T`.
pub fn decode_result<T: DeserializeOwned>(
    envelope: &AgentEnvelope,
    schema: &str,
    label: &str,
) -> Result<T> {
    let text = envelope
        .result
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| anyhow!("agent returned an empty {label}"))?;
    parse_validated(schema, strip_code_fence(text), label)
}

/// Agents sometimes wrap JSON in a markdown fence despite instructions.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Agent that spawns the configured CLI command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(role = ?request.role, iteration = request.iteration, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentEnvelope> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--json-schema")
            .arg(compact(request.schema)?)
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {program}"))?;

        write_agent_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent failed with status {:?}",
                output.status.code()
            ));
        }

        let envelope = parse_envelope(&output.stdout_lossy());
        if envelope.is_error {
            return Err(anyhow!(
                "agent reported an error (subtype '{}')",
                envelope.subtype
            ));
        }
        debug!(
            num_turns = envelope.num_turns,
            cost = envelope.cost,
            "agent completed"
        );
        Ok(envelope)
    }
}

/// Parse the CLI envelope. Unparseable stdout yields an envelope without a
/// result so the caller falls back to the working-tree diff.
fn parse_envelope(stdout: &str) -> AgentEnvelope {
    match serde_json::from_str::<AgentEnvelope>(stdout.trim()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(err = %err, "agent stdout is not a response envelope");
            AgentEnvelope::default()
        }
    }
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stdout_truncated > 0 || output.stderr_truncated > 0 {
        buf.push_str(&format!(
            "\n[truncated stdout {} bytes, stderr {} bytes]\n",
            output.stdout_truncated, output.stderr_truncated
        ));
    }
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

/// Deterministic agent for `--dry-run`: never spawns a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunAgent;

impl Agent for DryRunAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentEnvelope> {
        let result = match request.role {
            AgentRole::Coding => {
                let task_id = request.task_id.clone().unwrap_or_default();
                let handoff = Handoff {
                    summary: format!("Dry run of task {task_id}"),
                    task_completed: TaskCompleted {
                        task_id,
                        summary: "dry run".to_string(),
                        fully_complete: true,
                    },
                    ..Handoff::default()
                };
                serde_json::to_string(&handoff)?
            }
            AgentRole::Compaction => serde_json::to_string(&KnowledgeSummary {
                summary: format!("Dry run compaction at iteration {}", request.iteration),
                ..KnowledgeSummary::default()
            })?,
        };
        debug!(role = ?request.role, "dry run agent invoked");
        Ok(AgentEnvelope {
            kind: "result".to_string(),
            subtype: "success".to_string(),
            result: Some(result),
            ..AgentEnvelope::default()
        })
    }
}

/// Metadata describing an envelope, for event logs.
pub fn envelope_metadata(envelope: &AgentEnvelope) -> serde_json::Value {
    json!({
        "subtype": envelope.subtype,
        "cost": envelope.cost,
        "duration": envelope.duration,
        "num_turns": envelope.num_turns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::schema::{HANDOFF_SCHEMA, KNOWLEDGE_SUMMARY_SCHEMA};

    fn request(temp: &Path, role: AgentRole) -> AgentRequest {
        AgentRequest {
            workdir: temp.to_path_buf(),
            prompt: "prompt".to_string(),
            schema: HANDOFF_SCHEMA,
            role,
            task_id: Some("parser".to_string()),
            iteration: 3,
            max_turns: 5,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 100_000,
            log_path: temp.join("logs").join("iter-003.log"),
        }
    }

    #[test]
    fn envelope_accepts_cli_field_aliases() {
        let envelope = parse_envelope(
            r#"{"type":"result","subtype":"success","total_cost_usd":0.5,"duration_ms":1200,"num_turns":4,"is_error":false,"result":"{}"}"#,
        );
        assert_eq!(envelope.cost, 0.5);
        assert_eq!(envelope.duration, 1200);
        assert_eq!(envelope.result.as_deref(), Some("{}"));
    }

    #[test]
    fn garbage_stdout_yields_empty_result() {
        assert_eq!(parse_envelope("I did some stuff").result, None);
    }

    #[test]
    fn decode_result_rejects_empty_and_invalid() {
        let empty = AgentEnvelope {
            result: Some("   ".to_string()),
            ..AgentEnvelope::default()
        };
        assert!(decode_result::<Handoff>(&empty, HANDOFF_SCHEMA, "handoff").is_err());

        let invalid = AgentEnvelope {
            result: Some("{\"summary\": 3}".to_string()),
            ..AgentEnvelope::default()
        };
        assert!(decode_result::<Handoff>(&invalid, HANDOFF_SCHEMA, "handoff").is_err());
    }

    #[test]
    fn decode_result_strips_markdown_fence() {
        let envelope = AgentEnvelope {
            result: Some(
                "```json\n{\"summary\":\"s\",\"task_completed\":{\"task_id\":\"a\"}}\n```"
                    .to_string(),
            ),
            ..AgentEnvelope::default()
        };
        let handoff: Handoff = decode_result(&envelope, HANDOFF_SCHEMA, "handoff").expect("decode");
        assert_eq!(handoff.summary, "s");
    }

    #[test]
    fn dry_run_agent_returns_valid_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let envelope = DryRunAgent
            .invoke(&request(temp.path(), AgentRole::Coding))
            .expect("invoke");
        let handoff: Handoff = decode_result(&envelope, HANDOFF_SCHEMA, "handoff").expect("decode");
        assert_eq!(handoff.task_completed.task_id, "parser");
        assert!(handoff.task_completed.fully_complete);

        let envelope = DryRunAgent
            .invoke(&request(temp.path(), AgentRole::Compaction))
            .expect("invoke");
        let summary: KnowledgeSummary =
            decode_result(&envelope, KNOWLEDGE_SUMMARY_SCHEMA, "knowledge summary")
                .expect("decode");
        assert!(summary.summary.contains("iteration 3"));
    }

    #[test]
    fn command_agent_passes_schema_and_reads_envelope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("agent.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > prompt.txt\necho \"$@\" > args.txt\nprintf '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        )
        .expect("write script");
        let agent = CommandAgent::new(vec!["sh".to_string(), script.display().to_string()]);
        let envelope = agent
            .invoke(&request(temp.path(), AgentRole::Coding))
            .expect("invoke");
        assert_eq!(envelope.result.as_deref(), Some("ok"));
        assert_eq!(
            fs::read_to_string(temp.path().join("prompt.txt")).expect("prompt"),
            "prompt"
        );
        let args = fs::read_to_string(temp.path().join("args.txt")).expect("args");
        assert!(args.contains("--json-schema"));
        assert!(args.contains("--max-turns 5"));
        assert!(temp.path().join("logs").join("iter-003.log").is_file());
    }

    #[test]
    fn command_agent_fails_on_error_envelope_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '{\"is_error\":true,\"subtype\":\"error_max_turns\"}'".to_string(),
        ]);
        let err = agent
            .invoke(&request(temp.path(), AgentRole::Coding))
            .unwrap_err();
        assert!(err.to_string().contains("error_max_turns"));

        let agent = CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 2".to_string(),
        ]);
        let err = agent
            .invoke(&request(temp.path(), AgentRole::Coding))
            .unwrap_err();
        assert!(err.to_string().contains("agent failed"));
    }
}
