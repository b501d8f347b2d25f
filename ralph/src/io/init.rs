//! Initialization helpers for `.ralph/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{RalphConfig, write_config};
use super::files::write_json_atomic;
use super::knowledge_store::{INITIAL_INDEX_JSON, initial_index_markdown};
use super::run_state::{RunState, write_run_state};
use crate::core::classifier::RUNTIME_DIR;
use crate::core::types::Plan;

/// All canonical paths within `.ralph/` for a project root.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub state_path: PathBuf,
    pub progress_log_path: PathBuf,
    pub knowledge_md_path: PathBuf,
    pub knowledge_json_path: PathBuf,
    pub handoffs_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub context_dir: PathBuf,
    pub control_dir: PathBuf,
    pub commands_path: PathBuf,
    pub snapshots_dir: PathBuf,
    /// Scratch record for `--dry-run` (plan, state, progress, handoffs).
    pub dry_run_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub agent_logs_dir: PathBuf,
    pub validation_logs_dir: PathBuf,
    pub events_path: PathBuf,
    pub amendments_log_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(RUNTIME_DIR);
        let control_dir = ralph_dir.join("control");
        let logs_dir = ralph_dir.join("logs");
        Self {
            root: root.clone(),
            ralph_dir: ralph_dir.clone(),
            gitignore_path: ralph_dir.join(".gitignore"),
            config_path: ralph_dir.join("config.toml"),
            plan_path: ralph_dir.join("plan.json"),
            state_path: ralph_dir.join("state.json"),
            progress_log_path: ralph_dir.join("progress-log.json"),
            knowledge_md_path: ralph_dir.join("knowledge-index.md"),
            knowledge_json_path: ralph_dir.join("knowledge-index.json"),
            handoffs_dir: ralph_dir.join("handoffs"),
            skills_dir: ralph_dir.join("skills"),
            context_dir: ralph_dir.join("context"),
            commands_path: control_dir.join("commands.json"),
            control_dir,
            snapshots_dir: ralph_dir.join("snapshots"),
            dry_run_dir: ralph_dir.join("dry-run"),
            agent_logs_dir: logs_dir.join("agent"),
            validation_logs_dir: logs_dir.join("validation"),
            events_path: logs_dir.join("events.jsonl"),
            amendments_log_path: logs_dir.join("amendments.jsonl"),
            logs_dir,
        }
    }

    /// Point the run record at `dry-run/` so a rehearsal never touches the
    /// operator's plan, state, progress log, or handoff archive.
    pub fn into_dry_run(self) -> Self {
        Self {
            plan_path: self.dry_run_dir.join("plan.json"),
            state_path: self.dry_run_dir.join("state.json"),
            progress_log_path: self.dry_run_dir.join("progress-log.json"),
            handoffs_dir: self.dry_run_dir.join("handoffs"),
            ..self
        }
    }

    pub fn handoff_path(&self, iteration: u32) -> PathBuf {
        self.handoffs_dir
            .join(format!("handoff-{iteration:03}.json"))
    }

    pub fn validation_record_path(&self, iteration: u32) -> PathBuf {
        self.validation_logs_dir
            .join(format!("iter-{iteration:03}.json"))
    }

    pub fn agent_log_path(&self, iteration: u32) -> PathBuf {
        self.agent_logs_dir.join(format!("iter-{iteration:03}.log"))
    }

    pub fn compaction_log_path(&self, iteration: u32) -> PathBuf {
        self.agent_logs_dir
            .join(format!("compaction-{iteration:03}.log"))
    }

    pub fn prompt_path(&self, iteration: u32) -> PathBuf {
        self.context_dir.join(format!("prompt-{iteration:03}.md"))
    }

    pub fn plan_snapshot_path(&self, iteration: u32) -> PathBuf {
        self.snapshots_dir
            .join(format!("plan-before-amend-{iteration:03}.json"))
    }

    /// Markdown and JSON snapshot paths for the knowledge index.
    pub fn knowledge_snapshot_paths(&self, iteration: u32) -> (PathBuf, PathBuf) {
        (
            self.snapshots_dir
                .join(format!("knowledge-{iteration:03}.md")),
            self.snapshots_dir
                .join(format!("knowledge-{iteration:03}.json")),
        )
    }

    /// Path of the named skill, or `None` when the name could escape `skills/`.
    pub fn skill_path(&self, name: &str) -> Option<PathBuf> {
        is_plain_skill_name(name).then(|| self.skills_dir.join(format!("{name}.md")))
    }
}

/// Skill names are bare file stems: no separators, no `..`.
fn is_plain_skill_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

/// Options for `init_ralph`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.ralph/` scaffolding in `root`.
///
/// Fails if `.ralph/` already exists unless `options.force` is set. An
/// existing `plan.json` is authored by a human and is never overwritten.
pub fn init_ralph(root: &Path, options: &InitOptions) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if paths.ralph_dir.exists() && !paths.ralph_dir.is_dir() {
        return Err(anyhow!("ralph init: .ralph exists but is not a directory"));
    }
    if paths.ralph_dir.exists() && !options.force {
        return Err(anyhow!(
            "ralph init: .ralph already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.ralph_dir,
        &paths.handoffs_dir,
        &paths.skills_dir,
        &paths.context_dir,
        &paths.control_dir,
        &paths.snapshots_dir,
        &paths.agent_logs_dir,
        &paths.validation_logs_dir,
    ] {
        create_dir(dir)?;
    }
    // Keeps the otherwise empty handoff archive visible to git.
    write_file(&paths.handoffs_dir.join(".gitkeep"), "")?;

    write_file(&paths.gitignore_path, RALPH_GITIGNORE)?;
    write_config(&paths.config_path, &RalphConfig::default())?;
    if !paths.plan_path.exists() {
        write_json_atomic(&paths.plan_path, &Plan::default())?;
    }
    write_run_state(&paths.state_path, &mut RunState::default())?;
    write_file(&paths.knowledge_md_path, &initial_index_markdown())?;
    write_file(&paths.knowledge_json_path, INITIAL_INDEX_JSON)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const RALPH_GITIGNORE: &str = "logs/\ncontext/\ncontrol/\nsnapshots/\ndry-run/\n*.tmp\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::knowledge::{INDEX_HEADER, last_updated_iteration};

    fn read_to_string(path: &Path) -> String {
        fs::read_to_string(path).expect("read file")
    }

    /// Verifies init_ralph creates the complete directory structure and files.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_ralph(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.handoffs_dir.is_dir());
        assert!(paths.skills_dir.is_dir());
        assert!(paths.control_dir.is_dir());
        assert!(paths.validation_logs_dir.is_dir());
        assert!(paths.agent_logs_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(paths.state_path.is_file());
        assert_eq!(read_to_string(&paths.gitignore_path), RALPH_GITIGNORE);

        let plan: Plan = serde_json::from_str(&read_to_string(&paths.plan_path)).expect("plan");
        assert!(plan.tasks.is_empty());

        let index = read_to_string(&paths.knowledge_md_path);
        assert!(index.starts_with(INDEX_HEADER));
        assert_eq!(last_updated_iteration(&index), Some(0));
        assert_eq!(read_to_string(&paths.knowledge_json_path).trim(), "[]");
    }

    /// Verifies init_ralph refuses to overwrite without --force.
    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_ralph(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_ralph(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// Verifies --force rewrites scaffolding but keeps a user-authored plan.
    #[test]
    fn init_with_force_keeps_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_ralph(temp.path(), &InitOptions { force: false }).expect("init");
        let plan = "{\"tasks\":[{\"id\":\"a\",\"title\":\"A\",\"description\":\"d\"}]}\n";
        fs::write(&paths.plan_path, plan).expect("write plan");
        fs::write(&paths.config_path, "max_iterations = 2\n").expect("write config");

        init_ralph(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(read_to_string(&paths.plan_path), plan);
        assert!(!read_to_string(&paths.config_path).starts_with("max_iterations = 2\n"));
    }

    #[test]
    fn dry_run_paths_stay_inside_scratch_dir() {
        let paths = RalphPaths::new("/work").into_dry_run();
        for path in [
            &paths.plan_path,
            &paths.state_path,
            &paths.progress_log_path,
            &paths.handoffs_dir,
        ] {
            assert!(
                path.starts_with("/work/.ralph/dry-run"),
                "{}",
                path.display()
            );
        }
        assert_eq!(paths.config_path, PathBuf::from("/work/.ralph/config.toml"));
    }

    #[test]
    fn numbered_paths_are_zero_padded() {
        let paths = RalphPaths::new("/work");
        assert_eq!(
            paths.handoff_path(7),
            PathBuf::from("/work/.ralph/handoffs/handoff-007.json")
        );
        assert_eq!(
            paths.validation_record_path(12),
            PathBuf::from("/work/.ralph/logs/validation/iter-012.json")
        );
    }
}
