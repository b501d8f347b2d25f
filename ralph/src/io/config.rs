//! Orchestrator configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::classifier::{PatternClassifier, default_lint_patterns};
use crate::core::trigger::TriggerThresholds;
use crate::core::types::{DEFAULT_MAX_RETRIES, Mode};
use crate::core::verdict::{Check, DEFAULT_FAILURE_OUTPUT_CHARS, ValidationStrategy};
use crate::io::files::write_atomic;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    /// Iterations executed per `ralph run` invocation before stopping.
    pub max_iterations: u32,
    pub mode: Mode,
    /// Sleep between control-file polls while paused.
    pub poll_interval_secs: u64,
    /// Minimum delay between iterations.
    pub min_delay_secs: u64,
    /// `max_retries` filled into tasks added by amendments.
    pub max_retries_default: u32,
    pub agent: AgentConfig,
    pub validation: ValidationConfig,
    pub compaction: CompactionConfig,
    pub context: ContextConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line; `--json-schema` and `--max-turns` are appended.
    pub command: Vec<String>,
    pub max_turns: u32,
    pub timeout_secs: u64,
    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Kept as text so an unknown name degrades to `strict` instead of failing the load.
    pub strategy: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Per-check output cap in the failure context fed to the next attempt.
    pub failure_output_chars: usize,
    pub lint_patterns: Vec<String>,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    pub interval: u32,
    pub threshold_bytes: u64,
    pub novelty_threshold: f64,
    /// Number of recent handoff summaries compared by the novelty trigger.
    pub novelty_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: usize,
    pub max_knowledge_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub commit_prefix: String,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            mode: Mode::default(),
            poll_interval_secs: 5,
            min_delay_secs: 0,
            max_retries_default: DEFAULT_MAX_RETRIES,
            agent: AgentConfig::default(),
            validation: ValidationConfig::default(),
            compaction: CompactionConfig::default(),
            context: ContextConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "json", "--dangerously-skip-permissions"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            max_turns: 200,
            timeout_secs: 4 * 60 * 60,
            output_limit_bytes: 2_000_000,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strategy: ValidationStrategy::Strict.as_str().to_string(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            failure_output_chars: DEFAULT_FAILURE_OUTPUT_CHARS,
            lint_patterns: default_lint_patterns(),
            checks: Vec::new(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        let thresholds = TriggerThresholds::default();
        Self {
            interval: thresholds.interval,
            threshold_bytes: thresholds.threshold_bytes,
            novelty_threshold: thresholds.novelty_threshold,
            novelty_window: 3,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 12_000,
            max_knowledge_lines: 40,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_prefix: "ralph".to_string(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.max_retries_default == 0 {
            return Err(anyhow!("max_retries_default must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.max_turns == 0 {
            return Err(anyhow!("agent.max_turns must be > 0"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.validation.output_limit_bytes == 0 {
            return Err(anyhow!("validation.output_limit_bytes must be > 0"));
        }
        for (i, check) in self.validation.checks.iter().enumerate() {
            if check.argv.is_empty() || check.argv[0].trim().is_empty() {
                return Err(anyhow!("validation.checks[{i}].argv must be a non-empty array"));
            }
        }
        if self.compaction.interval == 0 {
            return Err(anyhow!("compaction.interval must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.compaction.novelty_threshold) {
            return Err(anyhow!("compaction.novelty_threshold must be within 0.0..=1.0"));
        }
        if self.compaction.novelty_window == 0 {
            return Err(anyhow!("compaction.novelty_window must be > 0"));
        }
        if self.context.budget_tokens == 0 {
            return Err(anyhow!("context.budget_tokens must be > 0"));
        }
        if self.git.commit_prefix.trim().is_empty() {
            return Err(anyhow!("git.commit_prefix must not be empty"));
        }
        Ok(())
    }

    /// Configured strategy; unknown names fall back to `strict` with a warning.
    pub fn strategy(&self) -> ValidationStrategy {
        match ValidationStrategy::parse(&self.validation.strategy) {
            Some(strategy) => strategy,
            None => {
                warn!(
                    strategy = %self.validation.strategy,
                    "unknown validation strategy, using strict"
                );
                ValidationStrategy::Strict
            }
        }
    }

    pub fn classifier(&self) -> PatternClassifier {
        PatternClassifier::new(self.validation.lint_patterns.iter().cloned())
    }

    pub fn thresholds(&self) -> TriggerThresholds {
        TriggerThresholds {
            novelty_threshold: self.compaction.novelty_threshold,
            threshold_bytes: self.compaction.threshold_bytes,
            interval: self.compaction.interval,
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
