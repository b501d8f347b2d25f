//! Validation strategies and failure-context rendering.

use serde::{Deserialize, Serialize};

use crate::core::classifier::CheckKind;

/// Output cap per failed check when rendering failure context.
pub const DEFAULT_FAILURE_OUTPUT_CHARS: usize = 500;

/// A configured validation check, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub argv: Vec<String>,
    /// Explicit classification; falls back to the classifier when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CheckKind>,
}

impl Check {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Policy for turning per-check results into a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStrategy {
    /// Every check must pass.
    #[default]
    Strict,
    /// Only test checks must pass; lint failures are recorded.
    Lenient,
    /// Same weighting as `Lenient`.
    TestsOnly,
}

impl ValidationStrategy {
    /// Parse a strategy name. Unknown names return `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "strict" => Some(Self::Strict),
            "lenient" => Some(Self::Lenient),
            "tests_only" => Some(Self::TestsOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lenient => "lenient",
            Self::TestsOnly => "tests_only",
        }
    }

    /// Whether a failing check of `kind` fails the whole validation.
    pub fn is_blocking(self, kind: CheckKind) -> bool {
        match self {
            Self::Strict => true,
            Self::Lenient | Self::TestsOnly => kind == CheckKind::Test,
        }
    }
}

/// Recorded outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub command: String,
    /// `None` when the check timed out or could not be spawned.
    pub exit_code: Option<i32>,
    pub output: String,
    pub passed: bool,
    #[serde(rename = "type")]
    pub kind: CheckKind,
}

/// Per-iteration validation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub iteration: u32,
    pub strategy: ValidationStrategy,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

/// Apply `strategy` to the check results. An empty check list passes.
pub fn evaluate(strategy: ValidationStrategy, checks: &[CheckResult]) -> bool {
    checks
        .iter()
        .all(|check| check.passed || !strategy.is_blocking(check.kind))
}

/// Render failed checks as a bounded summary for the next attempt's prompt.
///
/// Each check's output is cut to its last `max_output_chars` characters,
/// where test runners usually print the failure.
pub fn generate_failure_context(result: &ValidationResult, max_output_chars: usize) -> String {
    let mut out = String::new();
    for check in result.checks.iter().filter(|check| !check.passed) {
        let exit = match check.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "did not exit".to_string(),
        };
        let kind = match check.kind {
            CheckKind::Test => "test",
            CheckKind::Lint => "lint",
        };
        out.push_str(&format!("### `{}` ({kind}, {exit})\n", check.command));
        out.push_str("```\n");
        out.push_str(&tail_chars(check.output.trim_end(), max_output_chars));
        out.push_str("\n```\n\n");
    }
    out.trim_end().to_string()
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    format!("[... {} chars omitted]\n{tail}", total - max_chars)
}
