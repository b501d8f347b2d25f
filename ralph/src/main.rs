//! Transactional orchestrator for an external coding agent.
//!
//! Drives a task plan (`.ralph/plan.json`) one checkpointed iteration at a
//! time: select, prompt, invoke, validate, then commit or roll back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use ralph::core::types::Mode;
use ralph::exit_codes;
use ralph::io::init::{InitOptions, RalphPaths, init_ralph};
use ralph::looping::{LoopStop, run_loop};
use ralph::select::{SelectOutcome, select_from_path};
use ralph::start::{Backends, RunOptions, begin_run, prepare_run};
use ralph::step::{IterationOutcome, IterationVerdict};
use ralph::validate::validate_ralph;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Transactional orchestrator that drives a coding agent through a task plan"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.ralph/` scaffolding (config, state, knowledge index, empty plan).
    Init {
        /// Overwrite orchestrator-owned files. An existing plan is kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the control loop until the plan completes, blocks, or the limit is hit.
    Run {
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Iterations to execute in this invocation.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Stub agent, passing checks, and no git side effects.
        #[arg(long)]
        dry_run: bool,
        /// Continue from the persisted run state instead of starting fresh.
        #[arg(long)]
        resume: bool,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Print the id of the next eligible task.
    Select {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Check layout, config, plan schema and invariants, and the knowledge index.
    Validate {
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    HandoffOnly,
    HandoffPlusIndex,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::HandoffOnly => Mode::HandoffOnly,
            ModeArg::HandoffPlusIndex => Mode::HandoffPlusIndex,
        }
    }
}

fn main() {
    ralph::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            plan,
            config,
            max_iterations,
            dry_run,
            resume,
            mode,
        } => cmd_run(
            &root,
            RunOptions {
                plan_path: plan,
                config_path: config,
                max_iterations,
                mode: mode.map(Mode::from),
                dry_run,
                resume,
            },
        ),
        Command::Select { plan } => cmd_select(&root, plan),
        Command::Validate { plan, config } => cmd_validate(&root, plan, config),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_ralph(root, &InitOptions { force })?;
    println!("initialized {}", paths.ralph_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, options: RunOptions) -> Result<i32> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("install interrupt handler")?;

    let mut prepared = prepare_run(root, &options, interrupt)?;
    for id in &prepared.recovered {
        eprintln!("recovered: task {id} was in progress, reset to pending");
    }
    let backends = Backends::for_session(&prepared.session);
    begin_run(backends.vcs.as_ref())?;

    let outcome = run_loop(
        &mut prepared.session,
        backends.collaborators(),
        &mut prepared.plan,
        &mut prepared.state,
        report_iteration,
    )?;

    println!(
        "run: iterations={} stopped={}",
        outcome.iterations_executed,
        outcome.stop.run_status().as_str()
    );
    Ok(match outcome.stop {
        LoopStop::Complete => exit_codes::OK,
        LoopStop::Blocked { tasks } => {
            eprintln!("blocked: {}", tasks.join(", "));
            exit_codes::BLOCKED
        }
        LoopStop::MaxIterationsReached { .. } => exit_codes::MAX_ITERATIONS,
        LoopStop::Interrupted => exit_codes::INTERRUPTED,
    })
}

fn report_iteration(outcome: &IterationOutcome) {
    let verdict = match &outcome.verdict {
        IterationVerdict::Passed { synthetic: true, .. } => {
            "passed (synthetic handoff)".to_string()
        }
        IterationVerdict::Passed { .. } => "passed".to_string(),
        IterationVerdict::AgentFailed { reason } => format!("agent failed: {reason}"),
        IterationVerdict::ValidationFailed => "validation failed".to_string(),
        IterationVerdict::Interrupted => "interrupted".to_string(),
    };
    println!(
        "iteration {}: {} -> {} ({}, retries {})",
        outcome.iteration,
        outcome.task_id,
        outcome.task_status.as_str(),
        verdict,
        outcome.retry_count
    );
}

fn cmd_select(root: &Path, plan: Option<PathBuf>) -> Result<i32> {
    let plan_path = plan.unwrap_or_else(|| RalphPaths::new(root).plan_path);
    Ok(match select_from_path(&plan_path)? {
        SelectOutcome::Open(id) => {
            println!("{id}");
            exit_codes::OK
        }
        SelectOutcome::Complete => {
            eprintln!("plan complete: every task is done or skipped");
            exit_codes::COMPLETE
        }
        SelectOutcome::Blocked(tasks) => {
            eprintln!("blocked: no eligible task among {}", tasks.join(", "));
            exit_codes::BLOCKED
        }
    })
}

fn cmd_validate(root: &Path, plan: Option<PathBuf>, config: Option<PathBuf>) -> Result<i32> {
    let outcome = validate_ralph(root, plan.as_deref(), config.as_deref())?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "ok: {} task(s), {} check(s) in {}",
        outcome.tasks,
        outcome.checks,
        outcome.plan_path.display()
    );
    Ok(exit_codes::OK)
}
