//! Transactional checkpoint, rollback, and commit around an iteration.
//!
//! After any iteration the working tree is either committed or restored to
//! the checkpoint taken before the agent ran. The runtime-state directory is
//! never touched by a rollback so plan, state, and handoff files survive.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{RUNTIME_DIR, code_changes, is_runtime_path};
use crate::io::git::Git;

/// Opaque version-control reference captured before an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Version-control operations the control loop depends on.
pub trait VersionControl {
    /// Commit any pre-existing dirty state so the first checkpoint is well defined.
    ///
    /// Returns true when a commit was created.
    fn ensure_baseline(&self) -> Result<bool>;
    fn checkpoint(&self) -> Result<Checkpoint>;
    /// Restore tracked content to `checkpoint` and delete files created since,
    /// leaving the runtime-state directory alone.
    fn rollback(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Stage everything and commit. Returns false when there was nothing to commit.
    fn commit(&self, iteration: u32, task_id: &str, message: &str) -> Result<bool>;
    /// Working-tree changes outside the runtime-state directory.
    fn changed_paths(&self) -> Result<Vec<String>>;
}

/// Canonical, machine-parseable commit message.
pub fn commit_message(prefix: &str, iteration: u32, task_id: &str, message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    format!("{prefix}[{iteration}]: {task_id} — {first_line}")
}

/// Git-backed checkpoints.
#[derive(Debug, Clone)]
pub struct GitCheckpoints {
    git: Git,
    commit_prefix: String,
}

impl GitCheckpoints {
    pub fn new(root: &Path, commit_prefix: impl Into<String>) -> Self {
        Self {
            git: Git::new(root),
            commit_prefix: commit_prefix.into(),
        }
    }
}

impl VersionControl for GitCheckpoints {
    #[instrument(skip_all)]
    fn ensure_baseline(&self) -> Result<bool> {
        if self.git.head_sha()?.is_none() {
            info!("repository has no commits, creating baseline");
            self.git.add_all()?;
            self.git
                .commit_allow_empty(&format!("{}: baseline", self.commit_prefix))?;
            return Ok(true);
        }
        if self.git.status_porcelain()?.is_empty() {
            return Ok(false);
        }
        info!("auto-committing pre-existing changes");
        self.git.add_all()?;
        let message = format!("{}: auto-commit pre-existing changes", self.commit_prefix);
        self.git.commit_staged(&message)
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        let sha = self
            .git
            .head_sha()?
            .context("cannot checkpoint a repository without commits")?;
        debug!(checkpoint = %sha, "checkpoint captured");
        Ok(Checkpoint(sha))
    }

    #[instrument(skip_all, fields(checkpoint = checkpoint.as_str()))]
    fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        let rev = checkpoint.as_str();
        self.git.reset_mixed(rev).context("reset to checkpoint")?;
        let restorable = self
            .git
            .tracked_files(rev)?
            .iter()
            .any(|path| !is_runtime_path(Path::new(path)));
        if restorable {
            self.git
                .checkout_tree_except(rev, RUNTIME_DIR)
                .context("restore tracked files")?;
        }
        self.git
            .clean_untracked_except(RUNTIME_DIR)
            .context("remove files created since checkpoint")?;
        let leftover = self.changed_paths()?;
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "changes remain after rollback");
        }
        Ok(())
    }

    fn commit(&self, iteration: u32, task_id: &str, message: &str) -> Result<bool> {
        self.git.add_all()?;
        let subject = commit_message(&self.commit_prefix, iteration, task_id, message);
        self.git.commit_staged(&subject)
    }

    fn changed_paths(&self) -> Result<Vec<String>> {
        let paths: Vec<String> = self
            .git
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        Ok(code_changes(&paths))
    }
}

/// No-op backend for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunCheckpoints;

impl VersionControl for DryRunCheckpoints {
    fn ensure_baseline(&self) -> Result<bool> {
        Ok(false)
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint::new("dry-run"))
    }

    fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            checkpoint = checkpoint.as_str(),
            "dry run: skipping rollback"
        );
        Ok(())
    }

    fn commit(&self, iteration: u32, task_id: &str, message: &str) -> Result<bool> {
        debug!(
            message = %commit_message("dry-run", iteration, task_id, message),
            "dry run: skipping commit"
        );
        Ok(false)
    }

    fn changed_paths(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
