//! Git adapter for checkpoint, rollback, and commit.
//!
//! The orchestrator commits and restores deterministically, so we keep a
//! small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Initialize a repository in the working directory.
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "-q"])?;
        Ok(())
    }

    /// Set a repository-local config value.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", key, value])?;
        Ok(())
    }

    /// Full SHA of HEAD, or `None` when the repository has no commits yet.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Files tracked in the tree of `rev`.
    pub fn tracked_files(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-tree", "-r", "--name-only", rev])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    /// Commit whatever is staged, even nothing.
    pub fn commit_allow_empty(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "-q", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Subject line of the commit at `rev`.
    pub fn commit_subject(&self, rev: &str) -> Result<String> {
        Ok(self
            .run_capture(&["log", "-1", "--pretty=%s", rev])?
            .trim()
            .to_string())
    }

    /// Move HEAD and the index to `rev`, leaving the working tree alone.
    #[instrument(skip_all, fields(rev))]
    pub fn reset_mixed(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "-q", rev])?;
        Ok(())
    }

    /// Overwrite working-tree files with their content at `rev`, skipping `excluded_dir`.
    #[instrument(skip_all, fields(rev, excluded_dir))]
    pub fn checkout_tree_except(&self, rev: &str, excluded_dir: &str) -> Result<()> {
        let exclude = format!(":(exclude){excluded_dir}");
        self.run_checked(&["checkout", rev, "--", ".", &exclude])?;
        Ok(())
    }

    /// Delete untracked files and directories, keeping `excluded_dir` and ignored files.
    #[instrument(skip_all, fields(excluded_dir))]
    pub fn clean_untracked_except(&self, excluded_dir: &str) -> Result<()> {
        let exclude = format!("{excluded_dir}/");
        self.run_checked(&["clean", "-fdq", "-e", &exclude])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Strip the quotes git adds around paths with special characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn strips_quotes_from_special_paths() {
        let e = parse_status_line("?? \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn head_is_none_before_first_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        assert_eq!(git.head_sha().expect("head"), None);
    }
}
