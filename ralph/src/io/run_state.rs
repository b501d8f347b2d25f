//! Run state storage for iteration bookkeeping (`.ralph/state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{Mode, RunStatus};
use crate::io::files::write_json_atomic;

/// Validation-failure summary carried into the next attempt of the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub task_id: String,
    pub text: String,
}

/// Persisted bookkeeping for the control loop.
///
/// Mutated only by the loop and the compaction subsystem, and written after
/// every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    /// Last iteration number started (0 before the first).
    pub current_iteration: u32,
    /// First handoff number not yet consolidated into the knowledge index.
    pub last_compaction_iteration: u32,
    pub coding_iterations_since_compaction: u32,
    pub total_handoff_bytes_since_compaction: u64,
    pub last_task_id: Option<String>,
    pub status: RunStatus,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_context: Option<FailureContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl RunState {
    /// Fresh record for a new run whose iterations continue after `after_iteration`.
    pub fn fresh(mode: Mode, after_iteration: u32) -> Self {
        Self {
            current_iteration: after_iteration,
            last_compaction_iteration: after_iteration + 1,
            mode,
            started_at: Some(now_rfc3339()),
            ..Self::default()
        }
    }

    /// Failure text recorded for `task_id`, if the last attempt of that task failed.
    pub fn failure_for(&self, task_id: &str) -> Option<&str> {
        self.failure_context
            .as_ref()
            .filter(|ctx| ctx.task_id == task_id)
            .map(|ctx| ctx.text.as_str())
    }

    /// Reset the counters once a compaction at `iteration` succeeded.
    pub fn record_compaction(&mut self, iteration: u32) {
        self.last_compaction_iteration = iteration;
        self.coding_iterations_since_compaction = 0;
        self.total_handoff_bytes_since_compaction = 0;
    }

    /// Account for one archived coding handoff.
    pub fn record_handoff(&mut self, bytes: u64) {
        self.coding_iterations_since_compaction += 1;
        self.total_handoff_bytes_since_compaction += bytes;
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(
        current_iteration = state.current_iteration,
        status = ?state.status,
        "run state loaded"
    );
    Ok(state)
}

/// Stamp `updated_at` and atomically write run state to disk.
pub fn write_run_state(path: &Path, state: &mut RunState) -> Result<()> {
    state.updated_at = Some(now_rfc3339());
    debug!(
        path = %path.display(),
        current_iteration = state.current_iteration,
        status = ?state.status,
        "writing run state"
    );
    write_json_atomic(path, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies write → read preserves all fields.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        let mut state = RunState {
            current_iteration: 4,
            last_compaction_iteration: 2,
            coding_iterations_since_compaction: 2,
            total_handoff_bytes_since_compaction: 1234,
            last_task_id: Some("parser".to_string()),
            status: RunStatus::Running,
            mode: Mode::HandoffPlusIndex,
            failure_context: Some(FailureContext {
                task_id: "parser".to_string(),
                text: "cargo test failed".to_string(),
            }),
            started_at: Some("2024-01-01T00:00:00Z".to_string()),
            updated_at: None,
        };

        write_run_state(&path, &mut state).expect("write");
        assert!(state.updated_at.is_some());
        let loaded = load_run_state(&path).expect("load");
        assert_eq!(loaded, state);
    }

    /// Older or hand-written records missing fields still load.
    #[test]
    fn missing_fields_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{\"current_iteration\": 3}\n").expect("write");
        let loaded = load_run_state(&path).expect("load");
        assert_eq!(loaded.current_iteration, 3);
        assert_eq!(loaded.status, RunStatus::Idle);
        assert_eq!(loaded.mode, Mode::HandoffOnly);
    }

    #[test]
    fn failure_context_only_applies_to_its_task() {
        let state = RunState {
            failure_context: Some(FailureContext {
                task_id: "a".to_string(),
                text: "boom".to_string(),
            }),
            ..RunState::default()
        };
        assert_eq!(state.failure_for("a"), Some("boom"));
        assert_eq!(state.failure_for("b"), None);
    }

    #[test]
    fn fresh_state_continues_numbering() {
        let state = RunState::fresh(Mode::HandoffOnly, 7);
        assert_eq!(state.current_iteration, 7);
        assert_eq!(state.last_compaction_iteration, 8);
        assert_eq!(state.status, RunStatus::Idle);
    }

    #[test]
    fn compaction_resets_counters() {
        let mut state = RunState::default();
        state.record_handoff(100);
        state.record_handoff(50);
        assert_eq!(state.coding_iterations_since_compaction, 2);
        assert_eq!(state.total_handoff_bytes_since_compaction, 150);
        state.record_compaction(3);
        assert_eq!(state.last_compaction_iteration, 3);
        assert_eq!(state.coding_iterations_since_compaction, 0);
        assert_eq!(state.total_handoff_bytes_since_compaction, 0);
    }
}
