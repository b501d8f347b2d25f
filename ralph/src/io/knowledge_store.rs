//! Knowledge-index files and their durable snapshots.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::knowledge::INDEX_HEADER;
use crate::io::files::{read_optional, write_atomic, write_durable};
use crate::io::init::RalphPaths;

pub const INITIAL_INDEX_JSON: &str = "[]\n";

pub fn initial_index_markdown() -> String {
    format!("{INDEX_HEADER}\n\nLast updated at iteration 0\n")
}

/// Both halves of the knowledge index as raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeFiles {
    pub markdown: String,
    pub json: String,
}

impl KnowledgeFiles {
    pub fn initial() -> Self {
        Self {
            markdown: initial_index_markdown(),
            json: INITIAL_INDEX_JSON.to_string(),
        }
    }
}

/// Read the current index; missing files read as the initial artifacts.
pub fn read_knowledge(paths: &RalphPaths) -> Result<KnowledgeFiles> {
    let initial = KnowledgeFiles::initial();
    Ok(KnowledgeFiles {
        markdown: read_optional(&paths.knowledge_md_path)?.unwrap_or(initial.markdown),
        json: read_optional(&paths.knowledge_json_path)?.unwrap_or(initial.json),
    })
}

/// Durably copy the index aside before handing it to the agent.
#[instrument(skip_all, fields(iteration))]
pub fn snapshot_knowledge(
    paths: &RalphPaths,
    iteration: u32,
    files: &KnowledgeFiles,
) -> Result<()> {
    let (md_path, json_path) = paths.knowledge_snapshot_paths(iteration);
    write_durable(&md_path, &files.markdown).context("snapshot knowledge index markdown")?;
    write_durable(&json_path, &files.json).context("snapshot knowledge index json")?;
    debug!(path = %md_path.display(), "knowledge snapshot written");
    Ok(())
}

/// Put a snapshot back in place of the live index.
#[instrument(skip_all)]
pub fn restore_knowledge(paths: &RalphPaths, files: &KnowledgeFiles) -> Result<()> {
    write_restored(&paths.knowledge_md_path, &files.markdown)?;
    write_restored(&paths.knowledge_json_path, &files.json)
}

fn write_restored(path: &Path, contents: &str) -> Result<()> {
    write_atomic(path, contents).with_context(|| format!("restore {}", path.display()))
}
