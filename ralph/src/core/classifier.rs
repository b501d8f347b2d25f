//! Deterministic classification of validation checks and changed paths.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Name of the orchestrator's runtime-state directory.
pub const RUNTIME_DIR: &str = ".ralph";

/// Kind of a validation check, which decides how strategies weigh it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Test,
    Lint,
}

/// Decides whether a check command is a test or a lint.
pub trait CheckClassifier {
    fn classify(&self, argv: &[String]) -> CheckKind;
}

/// Substring classifier over the joined command line.
///
/// Any pattern hit yields `Lint`; everything else is a `Test`, so an
/// unrecognized check is always held to the strictest weighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternClassifier {
    lint_patterns: Vec<String>,
}

impl PatternClassifier {
    pub fn new(lint_patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lint_patterns: lint_patterns
                .into_iter()
                .map(|pattern| pattern.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(default_lint_patterns())
    }
}

impl CheckClassifier for PatternClassifier {
    fn classify(&self, argv: &[String]) -> CheckKind {
        let command = argv.join(" ").to_lowercase();
        if self
            .lint_patterns
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
        {
            CheckKind::Lint
        } else {
            CheckKind::Test
        }
    }
}

pub fn default_lint_patterns() -> Vec<String> {
    [
        "lint",
        "clippy",
        "shellcheck",
        "fmt",
        "eslint",
        "ruff",
        "flake8",
        "pylint",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// True if `path` lives under the runtime-state directory.
pub fn is_runtime_path(path: &Path) -> bool {
    let mut components = path
        .components()
        .filter(|component| !matches!(component, Component::CurDir | Component::RootDir));

    match components.next() {
        Some(Component::Normal(name)) => name == RUNTIME_DIR,
        _ => false,
    }
}

/// Changed paths outside the runtime-state directory, order preserved.
pub fn code_changes<P: AsRef<Path>>(changed_paths: &[P]) -> Vec<String> {
    changed_paths
        .iter()
        .map(AsRef::as_ref)
        .filter(|path| !is_runtime_path(path))
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn lint_patterns_classify_as_lint() {
        let classifier = PatternClassifier::default();
        assert_eq!(
            classifier.classify(&argv(&["cargo", "clippy", "--", "-D", "warnings"])),
            CheckKind::Lint
        );
        assert_eq!(
            classifier.classify(&argv(&["npm", "run", "ESLint"])),
            CheckKind::Lint
        );
    }

    #[test]
    fn unclassified_defaults_to_test() {
        let classifier = PatternClassifier::default();
        assert_eq!(
            classifier.classify(&argv(&["./scripts/check.sh"])),
            CheckKind::Test
        );
    }

    #[test]
    fn only_runtime_paths_are_filtered() {
        let paths = vec![
            PathBuf::from(".ralph/state.json"),
            PathBuf::from("./.ralph/handoffs/handoff-001.json"),
            PathBuf::from("src/lib.rs"),
            PathBuf::from("docs/.ralph-notes.md"),
        ];
        assert_eq!(
            code_changes(&paths),
            vec!["src/lib.rs".to_string(), "docs/.ralph-notes.md".to_string()]
        );
    }
}
