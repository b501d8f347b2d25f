//! Validation helpers for the `.ralph/` layout, configuration, plan, and
//! knowledge index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::knowledge::verify_knowledge_update;
use crate::io::config::load_config;
use crate::io::init::RalphPaths;
use crate::io::knowledge_store::read_knowledge;
use crate::io::plan_store::load_plan;
use crate::io::run_state::load_run_state;

/// Entries `.ralph/.gitignore` must carry.
const REQUIRED_GITIGNORE: [&str; 4] = ["logs/", "control/", "snapshots/", "*.tmp"];

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub plan_path: PathBuf,
    pub tasks: usize,
    pub checks: usize,
    /// Problems that do not stop a run (missing skill files).
    pub warnings: Vec<String>,
}

/// Validate `.ralph/` in `root`. Overrides replace the default plan and config locations.
pub fn validate_ralph(
    root: &Path,
    plan_path: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<ValidateOutcome> {
    let paths = RalphPaths::new(root);

    ensure_dir(&paths.ralph_dir)?;
    ensure_dir(&paths.handoffs_dir)?;
    ensure_file(&paths.gitignore_path)?;
    ensure_file(&paths.state_path)?;
    ensure_file(&paths.knowledge_md_path)?;
    ensure_file(&paths.knowledge_json_path)?;
    ensure_gitignore(&paths.gitignore_path)?;

    let config_path = config_path.unwrap_or(&paths.config_path);
    let config = load_config(config_path)
        .with_context(|| format!("load {}", config_path.display()))?;
    config.validate()?;

    let plan_path = plan_path.unwrap_or(&paths.plan_path).to_path_buf();
    ensure_file(&plan_path)?;
    let plan = load_plan(&plan_path)?;

    load_run_state(&paths.state_path).with_context(|| "load state.json")?;

    let knowledge = read_knowledge(&paths)?;
    let violations = verify_knowledge_update(
        &knowledge.markdown,
        &knowledge.json,
        &knowledge.markdown,
        &knowledge.json,
    );
    if !violations.is_empty() {
        return Err(anyhow!(
            "knowledge index is inconsistent:\n- {}",
            violations.join("\n- ")
        ));
    }

    let warnings = plan
        .tasks
        .iter()
        .flat_map(|task| task.skills.iter().map(move |skill| (task, skill)))
        .filter_map(|(task, skill)| match paths.skill_path(skill) {
            None => Some(format!("task '{}' has invalid skill name '{skill}'", task.id)),
            Some(path) if !path.is_file() => {
                Some(format!("task '{}' references missing skill '{skill}'", task.id))
            }
            Some(_) => None,
        })
        .collect();

    Ok(ValidateOutcome {
        plan_path,
        tasks: plan.tasks.len(),
        checks: config.validation.checks.len(),
        warnings,
    })
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing directory {}", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("expected directory {}", path.display()));
    }
    Ok(())
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    for required in REQUIRED_GITIGNORE {
        if !contents.lines().any(|line| line.trim() == required) {
            return Err(anyhow!("missing '{}' in {}", required, path.display()));
        }
    }
    Ok(())
}
