//! The control loop driving `ralph run`.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::state_update::skip_task;
use crate::core::types::{Plan, RunStatus};
use crate::io::control::{ControlCommand, consume_commands};
use crate::io::plan_store::write_plan;
use crate::io::run_state::{RunState, write_run_state};
use crate::select::{SelectOutcome, select_task};
use crate::session::{Collaborators, Session};
use crate::step::{IterationOutcome, IterationVerdict, run_iteration};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every task is done or skipped.
    Complete,
    /// No eligible task remains; lists the unsettled task ids.
    Blocked { tasks: Vec<String> },
    /// This invocation executed its iteration allowance.
    MaxIterationsReached { max_iterations: u32 },
    Interrupted,
}

impl LoopStop {
    pub fn run_status(&self) -> RunStatus {
        match self {
            LoopStop::Complete => RunStatus::Complete,
            LoopStop::Blocked { .. } => RunStatus::Blocked,
            LoopStop::MaxIterationsReached { .. } => RunStatus::MaxIterationsReached,
            LoopStop::Interrupted => RunStatus::Interrupted,
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub started_at_iteration: u32,
    pub iterations_executed: u32,
    pub stop: LoopStop,
}

/// Run iterations until the plan completes, blocks, the iteration allowance
/// is used up, or the operator interrupts.
///
/// Operator commands are applied at the top of every pass. An error from an
/// iteration stops the loop and is returned; the plan and state on disk are
/// those the iteration last persisted.
#[instrument(skip_all, fields(max_iterations = session.max_iterations, mode = session.mode.as_str()))]
pub fn run_loop<F: FnMut(&IterationOutcome)>(
    session: &mut Session,
    collab: Collaborators<'_>,
    plan: &mut Plan,
    state: &mut RunState,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let started_at_iteration = state.current_iteration;
    let mut iterations_executed = 0u32;
    collab.events.emit(
        "run_start",
        "control loop started",
        json!({
            "iteration": started_at_iteration,
            "mode": session.mode,
            "max_iterations": session.max_iterations,
            "dry_run": session.dry_run,
        }),
    );

    let stop = loop {
        if session.interrupted() {
            break LoopStop::Interrupted;
        }
        apply_pending_commands(session, collab, plan, state)?;
        if session.paused && !wait_while_paused(session, collab, plan, state)? {
            break LoopStop::Interrupted;
        }

        let task_id = match select_task(plan) {
            SelectOutcome::Open(id) => id,
            SelectOutcome::Complete => break LoopStop::Complete,
            SelectOutcome::Blocked(tasks) => break LoopStop::Blocked { tasks },
        };
        if iterations_executed >= session.max_iterations {
            break LoopStop::MaxIterationsReached {
                max_iterations: session.max_iterations,
            };
        }

        let outcome = run_iteration(session, collab, plan, state, &task_id)?;
        iterations_executed += 1;
        on_iteration(&outcome);
        if outcome.verdict == IterationVerdict::Interrupted {
            break LoopStop::Interrupted;
        }

        let delay = Duration::from_secs(session.config.min_delay_secs);
        if !delay.is_zero() && !sleep_interruptibly(session, delay) {
            break LoopStop::Interrupted;
        }
    };

    state.status = stop.run_status();
    write_run_state(&session.paths.state_path, state)?;
    info!(iterations_executed, stop = ?stop, "control loop stopped");
    collab.events.emit(
        "run_end",
        state.status.as_str(),
        json!({
            "iterations_executed": iterations_executed,
            "status": state.status,
            "iteration": state.current_iteration,
        }),
    );

    Ok(LoopOutcome {
        started_at_iteration,
        iterations_executed,
        stop,
    })
}

/// Consume the control queue and apply every command in order.
pub fn apply_pending_commands(
    session: &mut Session,
    collab: Collaborators<'_>,
    plan: &mut Plan,
    state: &mut RunState,
) -> Result<()> {
    for command in consume_commands(&session.paths.commands_path)? {
        apply_command(session, collab, plan, state, command)?;
    }
    Ok(())
}

fn apply_command(
    session: &mut Session,
    collab: Collaborators<'_>,
    plan: &mut Plan,
    state: &mut RunState,
    command: ControlCommand,
) -> Result<()> {
    match command {
        ControlCommand::Pause => {
            info!("paused by operator");
            session.paused = true;
            collab
                .events
                .emit("paused", "paused by operator", json!({}));
        }
        ControlCommand::Resume => {
            if session.paused {
                info!("resumed by operator");
                collab
                    .events
                    .emit("resumed", "resumed by operator", json!({}));
            }
            session.paused = false;
        }
        ControlCommand::InjectNote { note } => {
            debug!(note = %note, "operator note queued");
            collab.events.emit("note_injected", &note, json!({}));
            session.operator_notes.push(note);
        }
        ControlCommand::SkipTask { task_id, reason } => match skip_task(plan, &task_id) {
            Ok(transition) => {
                info!(
                    task_id = %task_id,
                    from = transition.from.as_str(),
                    "task skipped by operator"
                );
                if state.failure_for(&task_id).is_some() {
                    state.failure_context = None;
                    write_run_state(&session.paths.state_path, state)?;
                }
                write_plan(&session.paths.plan_path, plan)?;
                collab.events.emit(
                    "task_skipped",
                    reason.as_deref().unwrap_or("skipped by operator"),
                    json!({ "task_id": task_id, "from": transition.from.as_str() }),
                );
            }
            Err(err) => {
                warn!(task_id = %task_id, err = %err, "skip-task rejected");
                collab.events.emit(
                    "control_rejected",
                    &err,
                    json!({ "command": "skip-task", "task_id": task_id }),
                );
            }
        },
    }
    Ok(())
}

/// Poll the control queue until resumed. Returns false if interrupted first.
fn wait_while_paused(
    session: &mut Session,
    collab: Collaborators<'_>,
    plan: &mut Plan,
    state: &mut RunState,
) -> Result<bool> {
    let poll = Duration::from_secs(session.config.poll_interval_secs.max(1));
    while session.paused {
        if !sleep_interruptibly(session, poll) {
            return Ok(false);
        }
        apply_pending_commands(session, collab, plan, state)?;
    }
    Ok(!session.interrupted())
}

/// Sleep for `duration` in small slices. Returns false if interrupted.
fn sleep_interruptibly(session: &Session, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if session.interrupted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
