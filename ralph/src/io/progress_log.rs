//! Human-facing progress log (`.ralph/progress-log.json`), one entry per landed iteration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::Handoff;
use crate::io::files::{read_optional, write_json_atomic};
use crate::io::run_state::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub iteration: u32,
    pub task_id: String,
    pub summary: String,
    #[serde(default)]
    pub fully_complete: bool,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tests_added: Vec<String>,
    pub timestamp: String,
}

impl ProgressEntry {
    pub fn from_handoff(iteration: u32, task_id: &str, handoff: &Handoff) -> Self {
        Self {
            iteration,
            task_id: task_id.to_string(),
            summary: handoff.summary.clone(),
            fully_complete: handoff.task_completed.fully_complete,
            files_touched: handoff.files_touched.clone(),
            tests_added: handoff.tests_added.clone(),
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressLog {
    #[serde(default)]
    pub entries: Vec<ProgressEntry>,
}

pub fn load_progress(path: &Path) -> Result<ProgressLog> {
    match read_optional(path)? {
        Some(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("parse progress log {}", path.display())),
        None => Ok(ProgressLog::default()),
    }
}

/// Append an entry, rewriting the file atomically so dashboard readers never see a partial log.
pub fn append_progress(path: &Path, entry: ProgressEntry) -> Result<()> {
    let mut log = load_progress(path)?;
    log.entries.push(entry);
    write_json_atomic(path, &log)
}
