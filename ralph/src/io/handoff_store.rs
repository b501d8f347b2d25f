//! Handoff archive (`.ralph/handoffs/handoff-NNN.json`).
//!
//! Handoffs are written once per attempt and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::types::Handoff;

/// Archive rooted at the handoffs directory.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    dir: PathBuf,
}

impl HandoffStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("handoff-{iteration:03}.json"))
    }

    /// Archive a handoff. Fails if the number is already taken.
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, iteration: u32, handoff: &Handoff) -> Result<u64> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.path_for(iteration);
        let mut buf = serde_json::to_string_pretty(handoff).context("serialize handoff")?;
        buf.push('\n');
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create handoff {} (already archived?)", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write handoff {}", path.display()))?;
        debug!(iteration, bytes = buf.len(), "handoff archived");
        Ok(buf.len() as u64)
    }

    /// Archived handoff numbers in ascending order.
    pub fn numbers(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.dir.display()))?;
            if let Some(n) = parse_number(&entry.path()) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn highest_number(&self) -> Result<Option<u32>> {
        Ok(self.numbers()?.last().copied())
    }

    pub fn load(&self, iteration: u32) -> Result<Handoff> {
        let path = self.path_for(iteration);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read handoff {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse handoff {}", path.display()))
    }

    /// Most recent archived handoff.
    pub fn latest(&self) -> Result<Option<(u32, Handoff)>> {
        match self.highest_number()? {
            Some(n) => Ok(Some((n, self.load(n)?))),
            None => Ok(None),
        }
    }

    /// The last `count` handoffs, oldest first. Unreadable files are skipped.
    pub fn recent(&self, count: usize) -> Result<Vec<(u32, Handoff)>> {
        let numbers = self.numbers()?;
        let start = numbers.len().saturating_sub(count);
        Ok(self.load_lenient(&numbers[start..]))
    }

    /// Handoffs numbered `from..to`, oldest first. Unreadable files are skipped.
    pub fn range(&self, from: u32, to: u32) -> Result<Vec<(u32, Handoff)>> {
        let numbers: Vec<u32> = self
            .numbers()?
            .into_iter()
            .filter(|n| (from..to).contains(n))
            .collect();
        Ok(self.load_lenient(&numbers))
    }

    fn load_lenient(&self, numbers: &[u32]) -> Vec<(u32, Handoff)> {
        numbers
            .iter()
            .filter_map(|&n| match self.load(n) {
                Ok(handoff) => Some((n, handoff)),
                Err(err) => {
                    warn!(iteration = n, err = %format!("{err:#}"), "skipping unreadable handoff");
                    None
                }
            })
            .collect()
    }
}

fn parse_number(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("handoff-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Summaries only, for the novelty trigger.
pub fn summaries(handoffs: &[(u32, Handoff)]) -> Vec<String> {
    handoffs
        .iter()
        .map(|(_, handoff)| handoff.summary.clone())
        .collect()
}

/// Guard against reusing a number taken by a previous run.
pub fn ensure_unused(store: &HandoffStore, iteration: u32) -> Result<()> {
    if store.path_for(iteration).exists() {
        return Err(anyhow!(
            "handoff {} already exists; run state is behind the archive",
            iteration
        ));
    }
    Ok(())
}
