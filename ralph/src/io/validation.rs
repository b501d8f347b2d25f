//! Validation gate: run configured checks and persist the per-iteration record.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::CheckClassifier;
use crate::core::verdict::{Check, CheckResult, ValidationResult, ValidationStrategy, evaluate};
use crate::io::files::write_json_atomic;
use crate::io::process::run_command_with_timeout;

/// Raw outcome of running one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    /// `None` when the check timed out or could not be started.
    pub exit_code: Option<i32>,
    pub output: String,
}

impl CheckRun {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes a single validation check.
pub trait CheckRunner {
    fn run_check(&self, check: &Check, workdir: &Path) -> CheckRun;
}

/// Runs checks as child processes without a shell.
#[derive(Debug, Clone)]
pub struct ProcessCheckRunner {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ProcessCheckRunner {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }
}

impl CheckRunner for ProcessCheckRunner {
    #[instrument(skip_all, fields(command = %check.command_line()))]
    fn run_check(&self, check: &Check, workdir: &Path) -> CheckRun {
        let Some((program, args)) = check.argv.split_first() else {
            return CheckRun {
                exit_code: None,
                output: "empty check command".to_string(),
            };
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes) {
            Ok(output) => CheckRun {
                exit_code: output.exit_code(),
                output: output.combined("check"),
            },
            Err(err) => {
                warn!(err = %err, "check could not be run");
                CheckRun {
                    exit_code: None,
                    output: format!("{err:#}"),
                }
            }
        }
    }
}

/// Passes every check without spawning anything (`--dry-run`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunCheckRunner;

impl CheckRunner for DryRunCheckRunner {
    fn run_check(&self, check: &Check, _workdir: &Path) -> CheckRun {
        debug!(command = %check.command_line(), "dry run: skipping check");
        CheckRun {
            exit_code: Some(0),
            output: String::new(),
        }
    }
}

/// Run every check in order and apply `strategy`.
#[instrument(skip_all, fields(iteration, strategy = strategy.as_str(), checks = checks.len()))]
pub fn run_validation(
    runner: &dyn CheckRunner,
    checks: &[Check],
    strategy: ValidationStrategy,
    classifier: &dyn CheckClassifier,
    workdir: &Path,
    iteration: u32,
) -> ValidationResult {
    let results: Vec<CheckResult> = checks
        .iter()
        .map(|check| {
            let kind = check
                .kind
                .unwrap_or_else(|| classifier.classify(&check.argv));
            let run = runner.run_check(check, workdir);
            let passed = run.passed();
            if !passed {
                warn!(
                    command = %check.command_line(),
                    exit_code = ?run.exit_code,
                    output = %tail(&run.output, 200),
                    "check failed"
                );
            }
            CheckResult {
                command: check.command_line(),
                exit_code: run.exit_code,
                output: run.output,
                passed,
                kind,
            }
        })
        .collect();
    let passed = evaluate(strategy, &results);
    info!(passed, "validation finished");
    ValidationResult {
        iteration,
        strategy,
        passed,
        checks: results,
    }
}

/// Persist the record to `.ralph/logs/validation/iter-NNN.json`.
pub fn write_validation_record(path: &Path, result: &ValidationResult) -> Result<()> {
    write_json_atomic(path, result)
        .with_context(|| format!("write validation record {}", path.display()))
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::classifier::{CheckKind, PatternClassifier};

    fn check(argv: &[&str]) -> Check {
        Check {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            kind: None,
        }
    }

    fn runner() -> ProcessCheckRunner {
        ProcessCheckRunner::new(Duration::from_secs(10), 10_000)
    }

    #[test]
    fn strict_fails_on_lint_while_lenient_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checks = vec![
            check(&["sh", "-c", "echo tests ok"]),
            Check {
                kind: Some(CheckKind::Lint),
                ..check(&["sh", "-c", "echo style; exit 1"])
            },
        ];
        let classifier = PatternClassifier::default();
        let strict = run_validation(
            &runner(),
            &checks,
            ValidationStrategy::Strict,
            &classifier,
            temp.path(),
            1,
        );
        assert!(!strict.passed);
        assert_eq!(strict.checks[0].kind, CheckKind::Test);
        assert!(strict.checks[0].passed);
        assert_eq!(strict.checks[1].exit_code, Some(1));

        let lenient = run_validation(
            &runner(),
            &checks,
            ValidationStrategy::Lenient,
            &classifier,
            temp.path(),
            1,
        );
        assert!(lenient.passed);
    }

    #[test]
    fn missing_program_is_a_failed_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = runner().run_check(&check(&["definitely-not-a-real-binary-xyz"]), temp.path());
        assert_eq!(run.exit_code, None);
        assert!(!run.passed());
    }

    #[test]
    fn timed_out_check_has_no_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessCheckRunner::new(Duration::from_millis(100), 1000);
        let run = runner.run_check(&check(&["sleep", "5"]), temp.path());
        assert_eq!(run.exit_code, None);
        assert!(run.output.contains("timed out"));
    }

    #[test]
    fn checks_run_in_workdir_without_shell_expansion() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker"), "").expect("write");
        let run = runner().run_check(&check(&["ls", "marker", "$HOME"]), temp.path());
        assert!(run.output.contains("marker"));
        assert!(!run.passed());
    }

    #[test]
    fn record_is_written_as_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = run_validation(
            &DryRunCheckRunner,
            &[check(&["cargo", "clippy"])],
            ValidationStrategy::Strict,
            &PatternClassifier::default(),
            temp.path(),
            4,
        );
        let path = temp.path().join("iter-004.json");
        write_validation_record(&path, &result).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["passed"], true);
        assert_eq!(value["checks"][0]["type"], "lint");
        assert_eq!(value["strategy"], "strict");
    }

    #[test]
    fn empty_check_list_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = run_validation(
            &runner(),
            &[],
            ValidationStrategy::Strict,
            &PatternClassifier::default(),
            temp.path(),
            1,
        );
        assert!(result.passed);
    }
}
