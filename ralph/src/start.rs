//! Setup for `ralph run`: load configuration, plan, and run state, and wire
//! the collaborators the control loop talks to.
//!
//! Without `--resume` a fresh run state is created whose iteration counter
//! continues after the highest archived handoff, so handoff numbers never
//! collide with an earlier run. With `--resume` the persisted record is
//! loaded and must exist.
//!
//! `--dry-run` works on scratch copies under `.ralph/dry-run/`: the plan is
//! copied there (kept on `--resume`) and the run state, progress log, and
//! handoff archive are written there too.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::classifier::PatternClassifier;
use crate::core::state_update::recover_in_progress;
use crate::core::types::{Mode, Plan};
use crate::io::agent::{Agent, CommandAgent, DryRunAgent};
use crate::io::checkpoint::{DryRunCheckpoints, GitCheckpoints, VersionControl};
use crate::io::config::load_config;
use crate::io::events::{EventSink, JsonlEvents};
use crate::io::handoff_store::HandoffStore;
use crate::io::init::RalphPaths;
use crate::io::plan_store::{load_plan, write_plan};
use crate::io::run_state::{RunState, load_run_state, write_run_state};
use crate::io::validation::{CheckRunner, DryRunCheckRunner, ProcessCheckRunner};
use crate::session::{Collaborators, Session};

/// Command-line overrides for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plan_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub mode: Option<Mode>,
    pub dry_run: bool,
    pub resume: bool,
}

/// Everything the control loop needs, loaded and validated.
#[derive(Debug)]
pub struct PreparedRun {
    pub session: Session,
    pub plan: Plan,
    pub state: RunState,
    /// Tasks found `in_progress` (left by a crash) and returned to `pending`.
    pub recovered: Vec<String>,
}

/// Load and validate the run inputs in `root`.
pub fn prepare_run(
    root: &Path,
    options: &RunOptions,
    interrupt: Arc<AtomicBool>,
) -> Result<PreparedRun> {
    debug!(root = %root.display(), resume = options.resume, "preparing run");
    let mut paths = RalphPaths::new(root);
    if !paths.ralph_dir.is_dir() {
        return Err(anyhow!(
            "missing {} (run `ralph init` first)",
            paths.ralph_dir.display()
        ));
    }
    if let Some(plan_path) = &options.plan_path {
        paths.plan_path = plan_path.clone();
    }
    let config_path = options
        .config_path
        .clone()
        .unwrap_or_else(|| paths.config_path.clone());
    let config = load_config(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    config.validate()?;

    if options.dry_run {
        let rehearsal = paths.clone().into_dry_run();
        if !(options.resume && rehearsal.plan_path.is_file()) {
            let plan = load_plan(&paths.plan_path)?;
            write_plan(&rehearsal.plan_path, &plan)?;
            if !options.resume {
                clear_rehearsal(&rehearsal)?;
            }
        }
        info!(
            dir = %rehearsal.dry_run_dir.display(),
            "dry run: plan and run record are scratch copies"
        );
        paths = rehearsal;
    }

    let mut plan = load_plan(&paths.plan_path)?;
    let recovered = recover_in_progress(&mut plan);
    if !recovered.is_empty() {
        warn!(tasks = ?recovered, "returning tasks left in_progress to pending");
        write_plan(&paths.plan_path, &plan)?;
    }

    let archived = HandoffStore::new(&paths.handoffs_dir)
        .highest_number()?
        .unwrap_or(0);
    let mut state = if options.resume {
        let mut state = load_run_state(&paths.state_path)
            .with_context(|| "--resume requires an existing run state")?;
        if archived > state.current_iteration {
            warn!(
                current_iteration = state.current_iteration,
                archived, "run state is behind the handoff archive, advancing"
            );
            state.current_iteration = archived;
        }
        state
    } else {
        let previous = if paths.state_path.exists() {
            load_run_state(&paths.state_path)
                .map(|state| state.current_iteration)
                .unwrap_or_else(|err| {
                    warn!(err = %format!("{err:#}"), "ignoring unreadable run state");
                    0
                })
        } else {
            0
        };
        RunState::fresh(config.mode, archived.max(previous))
    };

    let mode = options.mode.unwrap_or(if options.resume {
        state.mode
    } else {
        config.mode
    });
    state.mode = mode;
    write_run_state(&paths.state_path, &mut state)?;

    let mut session = Session::new(paths, config, interrupt);
    session.mode = mode;
    session.dry_run = options.dry_run;
    if let Some(max_iterations) = options.max_iterations {
        session.max_iterations = max_iterations;
    }
    info!(
        mode = mode.as_str(),
        current_iteration = state.current_iteration,
        max_iterations = session.max_iterations,
        dry_run = session.dry_run,
        "run prepared"
    );

    Ok(PreparedRun {
        session,
        plan,
        state,
        recovered,
    })
}

/// Forget the previous rehearsal's state, progress, and handoffs.
fn clear_rehearsal(paths: &RalphPaths) -> Result<()> {
    for file in [&paths.state_path, &paths.progress_log_path] {
        if file.exists() {
            fs::remove_file(file).with_context(|| format!("remove {}", file.display()))?;
        }
    }
    if paths.handoffs_dir.exists() {
        fs::remove_dir_all(&paths.handoffs_dir)
            .with_context(|| format!("remove {}", paths.handoffs_dir.display()))?;
    }
    Ok(())
}

/// Owned backends selected for a session (real or dry-run).
pub struct Backends {
    pub agent: Box<dyn Agent>,
    pub checks: Box<dyn CheckRunner>,
    pub vcs: Box<dyn VersionControl>,
    pub events: Box<dyn EventSink>,
    pub classifier: PatternClassifier,
}

impl Backends {
    pub fn for_session(session: &Session) -> Self {
        let config = &session.config;
        let events: Box<dyn EventSink> = Box::new(JsonlEvents::new(&session.paths.events_path));
        let classifier = config.classifier();
        if session.dry_run {
            return Self {
                agent: Box::new(DryRunAgent),
                checks: Box::new(DryRunCheckRunner),
                vcs: Box::new(DryRunCheckpoints),
                events,
                classifier,
            };
        }
        Self {
            agent: Box::new(CommandAgent::new(config.agent.command.clone())),
            checks: Box::new(ProcessCheckRunner::new(
                config.check_timeout(),
                config.validation.output_limit_bytes,
            )),
            vcs: Box::new(GitCheckpoints::new(
                &session.paths.root,
                config.git.commit_prefix.clone(),
            )),
            events,
            classifier,
        }
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            agent: self.agent.as_ref(),
            checks: self.checks.as_ref(),
            vcs: self.vcs.as_ref(),
            events: self.events.as_ref(),
            classifier: &self.classifier,
        }
    }
}

/// Make the working tree checkpointable before the first iteration.
pub fn begin_run(vcs: &dyn VersionControl) -> Result<()> {
    if vcs.ensure_baseline()? {
        info!("baseline commit created");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Handoff, TaskStatus};
    use crate::test_support::{TestRepo, plan_of, task};

    fn prepare(repo: &TestRepo, options: &RunOptions) -> Result<PreparedRun> {
        prepare_run(repo.root(), options, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn fresh_run_numbers_after_archived_handoffs() {
        let repo = TestRepo::new().expect("repo");
        repo.write_plan(&plan_of(vec![task("a")])).expect("plan");
        let store = HandoffStore::new(&repo.paths().handoffs_dir);
        store.write(7, &Handoff::default()).expect("handoff");

        let prepared = prepare(&repo, &RunOptions::default()).expect("prepare");
        assert_eq!(prepared.state.current_iteration, 7);
        assert_eq!(prepared.state.last_compaction_iteration, 8);
        assert!(prepared.state.started_at.is_some());
    }

    #[test]
    fn resume_requires_existing_state() {
        let repo = TestRepo::new().expect("repo");
        repo.write_plan(&plan_of(vec![task("a")])).expect("plan");
        std::fs::remove_file(&repo.paths().state_path).expect("remove state");

        let err = prepare(
            &repo,
            &RunOptions {
                resume: true,
                ..RunOptions::default()
            },
        )
        .expect_err("resume without state");
        assert!(format!("{err:#}").contains("--resume"));
    }

    #[test]
    fn resume_keeps_counters_and_persisted_mode() {
        let repo = TestRepo::new().expect("repo");
        repo.write_plan(&plan_of(vec![task("a")])).expect("plan");
        let mut saved = RunState {
            current_iteration: 4,
            coding_iterations_since_compaction: 2,
            mode: Mode::HandoffPlusIndex,
            ..RunState::default()
        };
        write_run_state(&repo.paths().state_path, &mut saved).expect("state");

        let prepared = prepare(
            &repo,
            &RunOptions {
                resume: true,
                ..RunOptions::default()
            },
        )
        .expect("prepare");
        assert_eq!(prepared.state.current_iteration, 4);
        assert_eq!(prepared.state.coding_iterations_since_compaction, 2);
        assert_eq!(prepared.session.mode, Mode::HandoffPlusIndex);
    }

    #[test]
    fn crashed_in_progress_task_returns_to_pending() {
        let repo = TestRepo::new().expect("repo");
        let mut a = task("a");
        a.status = TaskStatus::InProgress;
        repo.write_plan(&plan_of(vec![a])).expect("plan");

        let prepared = prepare(&repo, &RunOptions::default()).expect("prepare");
        assert_eq!(prepared.recovered, vec!["a".to_string()]);
        let stored = load_plan(&repo.paths().plan_path).expect("plan");
        assert_eq!(stored.task("a").expect("a").status, TaskStatus::Pending);
    }

    #[test]
    fn overrides_apply_and_uninitialized_root_fails() {
        let repo = TestRepo::new().expect("repo");
        repo.write_plan(&plan_of(vec![task("a")])).expect("plan");
        let prepared = prepare(
            &repo,
            &RunOptions {
                max_iterations: Some(2),
                mode: Some(Mode::HandoffPlusIndex),
                dry_run: true,
                ..RunOptions::default()
            },
        )
        .expect("prepare");
        assert_eq!(prepared.session.max_iterations, 2);
        assert_eq!(prepared.state.mode, Mode::HandoffPlusIndex);
        assert!(prepared.session.dry_run);

        let temp = tempfile::tempdir().expect("tempdir");
        let err = prepare_run(
            temp.path(),
            &RunOptions::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .expect_err("not initialized");
        assert!(err.to_string().contains("ralph init"));
    }

    #[test]
    fn dry_run_works_on_scratch_copies() {
        let repo = TestRepo::new().expect("repo");
        let mut a = task("a");
        a.status = TaskStatus::InProgress;
        repo.write_plan(&plan_of(vec![a])).expect("plan");
        let real = repo.paths();
        let before_plan = std::fs::read(&real.plan_path).expect("read plan");
        let before_state = std::fs::read(&real.state_path).expect("read state");

        let dry = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let prepared = prepare(&repo, &dry).expect("prepare");
        let scratch_paths = &prepared.session.paths;
        assert_eq!(scratch_paths.plan_path, real.dry_run_dir.join("plan.json"));
        assert!(scratch_paths.handoffs_dir.starts_with(&real.dry_run_dir));
        assert_eq!(prepared.recovered, vec!["a".to_string()]);
        let scratch = load_plan(&scratch_paths.plan_path).expect("scratch plan");
        assert_eq!(scratch.task("a").expect("a").status, TaskStatus::Pending);

        let after_plan = std::fs::read(&real.plan_path).expect("read plan");
        let after_state = std::fs::read(&real.state_path).expect("read state");
        assert_eq!(after_plan, before_plan);
        assert_eq!(after_state, before_state);
    }
}
