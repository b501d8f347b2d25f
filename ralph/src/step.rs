//! Orchestration for a single transactional iteration of the control loop.
//!
//! An iteration either lands (handoff archived, plan updated, work committed)
//! or is rolled back to the checkpoint taken before the agent ran. Plan and
//! run state are written after every transition so a crash leaves valid JSON.

use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::compaction::{CompactionOutcome, knowledge_location, maybe_compact};
use crate::core::amendments::{AmendmentReport, apply_amendments, batch_within_limit};
use crate::core::retrieval::retrieve_relevant_knowledge;
use crate::core::state_update::{AttemptOutcome, Transition, begin_attempt, record_outcome};
use crate::core::types::{AmendmentAction, Handoff, Plan, RunStatus, Task, TaskStatus};
use crate::core::verdict::generate_failure_context;
use crate::io::agent::{AgentRequest, AgentRole, decode_result, envelope_metadata};
use crate::io::checkpoint::Checkpoint;
use crate::io::files::write_atomic;
use crate::io::handoff_store::ensure_unused;
use crate::io::knowledge_store::read_knowledge;
use crate::io::plan_store::{append_amendment_audit, snapshot_plan, write_plan};
use crate::io::progress_log::{ProgressEntry, append_progress};
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptPack};
use crate::io::run_state::{FailureContext, RunState, write_run_state};
use crate::io::schema::HANDOFF_SCHEMA;
use crate::io::skills::load_skills;
use crate::io::validation::{run_validation, write_validation_record};
use crate::session::{Collaborators, Session};

/// How the attempt at the selected task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationVerdict {
    /// Validation passed; the attempt landed.
    Passed {
        /// False when there was nothing to commit (or in a dry run).
        committed: bool,
        synthetic: bool,
        amendments_accepted: usize,
    },
    /// The agent invocation failed or returned nothing usable.
    AgentFailed { reason: String },
    ValidationFailed,
    Interrupted,
}

/// Result of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    /// Iteration number (also the handoff number).
    pub iteration: u32,
    pub task_id: String,
    pub verdict: IterationVerdict,
    /// Task status after the outcome was recorded.
    pub task_status: TaskStatus,
    pub retry_count: u32,
    pub compaction: CompactionOutcome,
}

/// Run one iteration against `task_id`, which the caller selected.
#[instrument(skip_all, fields(iteration = state.current_iteration + 1, task_id = %task_id))]
pub fn run_iteration(
    session: &mut Session,
    collab: Collaborators<'_>,
    plan: &mut Plan,
    state: &mut RunState,
    task_id: &str,
) -> Result<IterationOutcome> {
    let iteration = state.current_iteration + 1;
    let task: Task = plan
        .task(task_id)
        .cloned()
        .ok_or_else(|| anyhow!("selected task '{task_id}' is not in the plan"))?;
    let store = session.handoffs();
    ensure_unused(&store, iteration)?;

    collab.events.emit(
        "iteration_start",
        &format!("iteration {iteration}: {}", task.title),
        json!({ "iteration": iteration, "task_id": task_id, "retry_count": task.retry_count }),
    );

    let compaction = maybe_compact(session, collab, state, &task, iteration)?;

    begin_attempt(plan, task_id).map_err(|err| anyhow!("begin attempt: {err}"))?;
    state.current_iteration = iteration;
    state.last_task_id = Some(task_id.to_string());
    state.status = RunStatus::Running;
    persist(session, plan, state)?;

    let checkpoint = collab.vcs.checkpoint()?;
    debug!(checkpoint = checkpoint.as_str(), "checkpoint taken");

    let prompt = assemble_prompt(session, state, &task, iteration)?;
    write_atomic(&session.paths.prompt_path(iteration), &prompt.content)?;
    if prompt.truncation.was_truncated() {
        collab.events.emit(
            "context_truncated",
            "prompt exceeded the context budget",
            json!({
                "iteration": iteration,
                "evicted": prompt.truncation.evicted,
                "original_chars": prompt.truncation.original_chars,
                "budget_chars": prompt.truncation.budget_chars,
            }),
        );
    }

    let attempt = Attempt {
        iteration,
        task_id,
        checkpoint: &checkpoint,
        compaction,
    };

    let request = AgentRequest {
        workdir: session.paths.root.clone(),
        prompt: prompt.content,
        schema: HANDOFF_SCHEMA,
        role: AgentRole::Coding,
        task_id: Some(task_id.to_string()),
        iteration,
        max_turns: session.config.agent.max_turns,
        timeout: session.config.agent_timeout(),
        output_limit_bytes: session.config.agent.output_limit_bytes,
        log_path: session.paths.agent_log_path(iteration),
    };
    let invoked = collab.agent.invoke(&request);

    if session.interrupted() {
        return attempt.interrupted(session, collab, plan, state);
    }

    let envelope = match invoked {
        Ok(envelope) => envelope,
        Err(err) => {
            return attempt.agent_failed(session, collab, plan, state, format!("{err:#}"));
        }
    };
    collab.events.emit(
        "agent_complete",
        "agent returned",
        envelope_metadata(&envelope),
    );

    let handoff = match decode_result::<Handoff>(&envelope, HANDOFF_SCHEMA, "handoff") {
        Ok(handoff) => handoff,
        Err(err) => {
            let changed = collab.vcs.changed_paths()?;
            if changed.is_empty() {
                return attempt.agent_failed(
                    session,
                    collab,
                    plan,
                    state,
                    format!("{err:#}; working tree unchanged"),
                );
            }
            warn!(
                err = %format!("{err:#}"),
                files = changed.len(),
                "no usable handoff, synthesizing one from the diff"
            );
            Handoff::synthetic(task_id, changed)
        }
    };
    if handoff.task_completed.task_id != task_id {
        warn!(
            reported = %handoff.task_completed.task_id,
            "handoff reports a different task id"
        );
    }

    let bytes = store.write(iteration, &handoff)?;
    state.record_handoff(bytes);

    let validation = run_validation(
        collab.checks,
        &session.config.validation.checks,
        session.config.strategy(),
        collab.classifier,
        &session.paths.root,
        iteration,
    );
    write_validation_record(
        &session.paths.validation_record_path(iteration),
        &validation,
    )?;

    if !validation.passed {
        let failure = generate_failure_context(
            &validation,
            session.config.validation.failure_output_chars,
        );
        return attempt.validation_failed(session, collab, plan, state, failure);
    }

    attempt.passed(session, collab, plan, state, &handoff)
}

/// Carries what the outcome branches share.
struct Attempt<'a> {
    iteration: u32,
    task_id: &'a str,
    checkpoint: &'a Checkpoint,
    compaction: CompactionOutcome,
}

impl Attempt<'_> {
    fn passed(
        self,
        session: &Session,
        collab: Collaborators<'_>,
        plan: &mut Plan,
        state: &mut RunState,
        handoff: &Handoff,
    ) -> Result<IterationOutcome> {
        let report = self.amend(session, plan, handoff)?;

        let transition = record(plan, self.task_id, AttemptOutcome::Passed)?;
        if !handoff.task_completed.fully_complete {
            warn!("validation passed but the agent reports the task as not fully complete");
        }
        state.failure_context = None;
        persist(session, plan, state)?;
        append_progress(
            &session.paths.progress_log_path,
            ProgressEntry::from_handoff(self.iteration, self.task_id, handoff),
        )?;

        let committed = collab
            .vcs
            .commit(self.iteration, self.task_id, &handoff.summary)?;
        info!(committed, synthetic = handoff.synthetic, "iteration landed");
        collab.events.emit(
            "iteration_end",
            &handoff.summary,
            json!({
                "iteration": self.iteration,
                "task_id": self.task_id,
                "result": "passed",
                "committed": committed,
                "synthetic": handoff.synthetic,
                "amendments_accepted": report.accepted(),
                "amendments_rejected": report.rejected(),
            }),
        );
        Ok(self.outcome(
            IterationVerdict::Passed {
                committed,
                synthetic: handoff.synthetic,
                amendments_accepted: report.accepted(),
            },
            transition,
        ))
    }

    /// Apply the handoff's amendments while the task is still `in_progress`.
    fn amend(
        &self,
        session: &Session,
        plan: &mut Plan,
        handoff: &Handoff,
    ) -> Result<AmendmentReport> {
        if handoff.plan_amendments.is_empty() {
            return Ok(AmendmentReport::default());
        }
        if batch_within_limit(&handoff.plan_amendments) {
            snapshot_plan(&session.paths.plan_snapshot_path(self.iteration), plan)?;
        }
        let report = apply_amendments(plan, handoff, self.task_id);
        apply_retry_default(plan, handoff, &report, session.config.max_retries_default);
        append_amendment_audit(
            &session.paths.amendments_log_path,
            self.iteration,
            self.task_id,
            &report,
        )?;
        if let Some(reason) = report.batch_rejected.as_deref() {
            warn!(reason, "amendment batch rejected");
        } else {
            info!(
                accepted = report.accepted(),
                rejected = report.rejected(),
                "amendments applied"
            );
        }
        Ok(report)
    }

    fn validation_failed(
        self,
        session: &Session,
        collab: Collaborators<'_>,
        plan: &mut Plan,
        state: &mut RunState,
        failure: String,
    ) -> Result<IterationOutcome> {
        collab.vcs.rollback(self.checkpoint)?;
        let transition = record(plan, self.task_id, AttemptOutcome::Failed)?;
        warn!(
            retry_count = transition.retry_count,
            status = transition.to.as_str(),
            "validation failed, attempt rolled back"
        );
        state.failure_context = Some(FailureContext {
            task_id: self.task_id.to_string(),
            text: failure,
        });
        persist(session, plan, state)?;
        collab.events.emit(
            "validation_failed",
            &format!("validation failed for {}", self.task_id),
            json!({
                "iteration": self.iteration,
                "task_id": self.task_id,
                "retry_count": transition.retry_count,
                "status": transition.to.as_str(),
            }),
        );
        Ok(self.outcome(IterationVerdict::ValidationFailed, transition))
    }

    fn agent_failed(
        self,
        session: &Session,
        collab: Collaborators<'_>,
        plan: &mut Plan,
        state: &mut RunState,
        reason: String,
    ) -> Result<IterationOutcome> {
        collab.vcs.rollback(self.checkpoint)?;
        let transition = record(plan, self.task_id, AttemptOutcome::Failed)?;
        warn!(
            reason = %reason,
            retry_count = transition.retry_count,
            status = transition.to.as_str(),
            "agent attempt failed, rolled back"
        );
        // Only validation output is ever shown to the agent.
        state.failure_context = None;
        persist(session, plan, state)?;
        collab.events.emit(
            "agent_failed",
            &reason,
            json!({
                "iteration": self.iteration,
                "task_id": self.task_id,
                "retry_count": transition.retry_count,
                "status": transition.to.as_str(),
            }),
        );
        Ok(self.outcome(
            IterationVerdict::AgentFailed { reason },
            transition,
        ))
    }

    fn interrupted(
        self,
        session: &Session,
        collab: Collaborators<'_>,
        plan: &mut Plan,
        state: &mut RunState,
    ) -> Result<IterationOutcome> {
        collab.vcs.rollback(self.checkpoint)?;
        let transition = record(plan, self.task_id, AttemptOutcome::Interrupted)?;
        state.status = RunStatus::Interrupted;
        persist(session, plan, state)?;
        warn!("interrupted, attempt rolled back");
        collab.events.emit(
            "interrupted",
            "run interrupted during agent invocation",
            json!({ "iteration": self.iteration, "task_id": self.task_id }),
        );
        Ok(self.outcome(IterationVerdict::Interrupted, transition))
    }

    fn outcome(self, verdict: IterationVerdict, transition: Transition) -> IterationOutcome {
        IterationOutcome {
            iteration: self.iteration,
            task_id: self.task_id.to_string(),
            verdict,
            task_status: transition.to,
            retry_count: transition.retry_count,
            compaction: self.compaction,
        }
    }
}

fn record(plan: &mut Plan, task_id: &str, outcome: AttemptOutcome) -> Result<Transition> {
    record_outcome(plan, task_id, outcome).map_err(|err| anyhow!("record outcome: {err}"))
}

fn persist(session: &Session, plan: &Plan, state: &mut RunState) -> Result<()> {
    write_plan(&session.paths.plan_path, plan)?;
    write_run_state(&session.paths.state_path, state)
}

/// Tasks added without an explicit `max_retries` get the configured default.
fn apply_retry_default(plan: &mut Plan, handoff: &Handoff, report: &AmendmentReport, default: u32) {
    for decision in report
        .decisions
        .iter()
        .filter(|d| d.accepted && d.action == AmendmentAction::Add)
    {
        let explicit = handoff
            .plan_amendments
            .get(decision.index)
            .and_then(|amendment| amendment.task.as_ref())
            .is_some_and(|body| body.get("max_retries").is_some());
        if explicit {
            continue;
        }
        if let Some(id) = decision.task_id.as_deref()
            && let Some(task) = plan.task_mut(id)
        {
            task.max_retries = default;
        }
    }
}

/// Build the coding prompt. Drains the operator notes.
fn assemble_prompt(
    session: &mut Session,
    state: &RunState,
    task: &Task,
    iteration: u32,
) -> Result<PromptPack> {
    let notes = std::mem::take(&mut session.operator_notes);
    let recent = session
        .handoffs()
        .recent(session.config.compaction.novelty_window)?;
    let (project_memory, location) = if session.mode.uses_knowledge_index() {
        let knowledge = read_knowledge(&session.paths)?;
        let lines = retrieve_relevant_knowledge(
            task,
            &knowledge.markdown,
            session.config.context.max_knowledge_lines,
        );
        (lines, Some(knowledge_location(session)))
    } else {
        (Vec::new(), None)
    };
    let skills = load_skills(&session.paths, &task.skills)?;

    PromptBuilder::new(session.config.context.budget_tokens).build_iteration(&PromptInputs {
        iteration,
        task,
        operator_notes: &notes,
        failure_context: state.failure_for(&task.id),
        recent_handoffs: &recent,
        project_memory: &project_memory,
        knowledge: location.as_ref(),
        skills: &skills,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::core::classifier::PatternClassifier;
    use crate::core::verdict::Check;
    use crate::io::checkpoint::{GitCheckpoints, VersionControl};
    use crate::io::handoff_store::HandoffStore;
    use crate::io::plan_store::load_plan;
    use crate::io::validation::CheckRun;
    use crate::test_support::{
        RecordingEvents, ScriptedAgent, ScriptedCheckRunner, ScriptedReply, TestRepo, handoff_for,
        plan_of, task, test_session,
    };

    struct Fixture {
        repo: TestRepo,
        session: Session,
        plan: Plan,
        state: RunState,
    }

    fn fixture() -> Fixture {
        let repo = TestRepo::new().expect("repo");
        let mut session = test_session(repo.root());
        session.config.validation.checks = vec![Check {
            argv: vec!["cargo".to_string(), "test".to_string()],
            kind: None,
        }];
        let plan = plan_of(vec![task("a"), task("b")]);
        write_plan(&session.paths.plan_path, &plan).expect("plan");
        Fixture {
            repo,
            session,
            plan,
            state: RunState::fresh(Default::default(), 0),
        }
    }

    fn run(
        fx: &mut Fixture,
        agent: &ScriptedAgent,
        checks: &ScriptedCheckRunner,
        events: &RecordingEvents,
    ) -> IterationOutcome {
        let vcs = GitCheckpoints::new(fx.repo.root(), "ralph");
        let classifier = PatternClassifier::default();
        let collab = Collaborators {
            agent,
            checks,
            vcs: &vcs,
            events,
            classifier: &classifier,
        };
        run_iteration(&mut fx.session, collab, &mut fx.plan, &mut fx.state, "a").expect("iteration")
    }

    #[test]
    fn passing_iteration_commits_and_marks_done() {
        let mut fx = fixture();
        let agent = ScriptedAgent::new(vec![
            ScriptedReply::handoff(&handoff_for("a", "Implemented a"))
                .with_writes(vec![("src/a.rs", "pub fn a() {}\n")]),
        ]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        let outcome = run(&mut fx, &agent, &checks, &events);
        assert_eq!(outcome.iteration, 1);
        assert_eq!(outcome.task_status, TaskStatus::Done);
        assert!(matches!(
            outcome.verdict,
            IterationVerdict::Passed { committed: true, synthetic: false, .. }
        ));
        assert_eq!(
            fx.repo.last_commit_subject().expect("subject"),
            "ralph[1]: a — Implemented a"
        );
        let stored = load_plan(&fx.session.paths.plan_path).expect("plan");
        assert_eq!(stored.task("a").expect("a").status, TaskStatus::Done);
        assert!(fx.session.handoffs().path_for(1).exists());
        assert!(fx.session.paths.validation_record_path(1).exists());
        assert_eq!(fx.state.coding_iterations_since_compaction, 1);
        assert_eq!(
            events.names(),
            vec!["iteration_start", "agent_complete", "iteration_end"]
        );
    }

    #[test]
    fn failed_validation_rolls_back_and_feeds_failure_into_next_prompt() {
        let mut fx = fixture();
        let agent = ScriptedAgent::new(vec![
            ScriptedReply::handoff(&handoff_for("a", "Broke a"))
                .with_writes(vec![("src/a.rs", "broken\n")]),
            ScriptedReply::handoff(&handoff_for("a", "Fixed a")),
        ]);
        let checks = ScriptedCheckRunner::new(vec![
            CheckRun {
                exit_code: Some(101),
                output: "test a::works ... FAILED".to_string(),
            },
            CheckRun {
                exit_code: Some(0),
                output: String::new(),
            },
        ]);
        let events = RecordingEvents::default();

        let first = run(&mut fx, &agent, &checks, &events);
        assert_eq!(first.verdict, IterationVerdict::ValidationFailed);
        assert_eq!(
            (first.task_status, first.retry_count),
            (TaskStatus::Pending, 1)
        );
        assert!(!fx.repo.root().join("src/a.rs").exists());
        assert!(
            fx.state
                .failure_for("a")
                .is_some_and(|text| text.contains("a::works ... FAILED"))
        );

        let second = run(&mut fx, &agent, &checks, &events);
        assert_eq!(second.iteration, 2);
        assert_eq!(second.task_status, TaskStatus::Done);
        let prompts = agent.prompts();
        assert!(prompts[1].contains("## Failure Context"));
        assert!(prompts[1].contains("a::works ... FAILED"));
        assert!(fx.state.failure_context.is_none());
    }

    #[test]
    fn agent_error_consumes_a_retry_without_failure_context() {
        let mut fx = fixture();
        fx.plan.task_mut("a").expect("a").max_retries = 1;
        let agent = ScriptedAgent::new(vec![ScriptedReply::failure("agent exited with status 1")]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        let outcome = run(&mut fx, &agent, &checks, &events);
        assert!(matches!(outcome.verdict, IterationVerdict::AgentFailed { .. }));
        assert_eq!(outcome.task_status, TaskStatus::Failed);
        assert!(fx.state.failure_context.is_none());
        assert_eq!(checks.calls(), 0);
    }

    #[test]
    fn empty_result_with_changes_yields_synthetic_handoff() {
        let mut fx = fixture();
        let agent = ScriptedAgent::new(vec![
            ScriptedReply::empty().with_writes(vec![("src/new.rs", "fn x() {}\n")]),
        ]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        let outcome = run(&mut fx, &agent, &checks, &events);
        assert!(matches!(
            outcome.verdict,
            IterationVerdict::Passed { synthetic: true, .. }
        ));
        let archived = HandoffStore::new(&fx.session.paths.handoffs_dir)
            .load(1)
            .expect("handoff");
        assert!(archived.synthetic);
        assert_eq!(archived.files_touched, vec!["src/new.rs".to_string()]);
    }

    #[test]
    fn empty_result_without_changes_is_a_hard_failure() {
        let mut fx = fixture();
        let agent = ScriptedAgent::new(vec![ScriptedReply::empty()]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        let outcome = run(&mut fx, &agent, &checks, &events);
        let IterationVerdict::AgentFailed { reason } = outcome.verdict else {
            panic!("expected agent failure");
        };
        assert!(reason.contains("working tree unchanged"));
        assert!(!fx.session.handoffs().path_for(1).exists());
    }

    #[test]
    fn interrupt_during_agent_rolls_back_without_consuming_retry() {
        let repo = TestRepo::new().expect("repo");
        let flag = Arc::new(AtomicBool::new(false));
        let mut session = Session::new(repo.paths(), Default::default(), flag.clone());
        let mut plan = plan_of(vec![task("a")]);
        let mut state = RunState::fresh(Default::default(), 0);
        let agent = ScriptedAgent::new(vec![
            ScriptedReply::handoff(&handoff_for("a", "half done"))
                .with_writes(vec![("half.txt", "wip\n")])
                .interrupting(flag),
        ]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();
        let vcs = GitCheckpoints::new(repo.root(), "ralph");
        let classifier = PatternClassifier::default();
        let collab = Collaborators {
            agent: &agent,
            checks: &checks,
            vcs: &vcs,
            events: &events,
            classifier: &classifier,
        };

        let outcome =
            run_iteration(&mut session, collab, &mut plan, &mut state, "a").expect("iteration");
        assert_eq!(outcome.verdict, IterationVerdict::Interrupted);
        assert_eq!(
            (outcome.task_status, outcome.retry_count),
            (TaskStatus::Pending, 0)
        );
        assert_eq!(state.status, RunStatus::Interrupted);
        assert!(!repo.root().join("half.txt").exists());
        assert!(vcs.changed_paths().expect("status").is_empty());
        let saved: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&session.paths.state_path).expect("state"),
        )
        .expect("valid json");
        assert_eq!(saved["status"], "interrupted");
    }

    #[test]
    fn operator_notes_are_drained_into_the_prompt() {
        let mut fx = fixture();
        fx.session
            .operator_notes
            .push("prefer small commits".to_string());
        let agent = ScriptedAgent::new(vec![ScriptedReply::handoff(&handoff_for("a", "done"))]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        run(&mut fx, &agent, &checks, &events);
        assert!(agent.prompts()[0].contains("- prefer small commits"));
        assert!(fx.session.operator_notes.is_empty());
        assert!(fx.session.paths.prompt_path(1).exists());
    }

    #[test]
    fn amendments_are_applied_and_audited() {
        let mut fx = fixture();
        fx.session.config.max_retries_default = 5;
        let mut handoff = handoff_for("a", "Implemented a, found more work");
        handoff.plan_amendments = serde_json::from_value(json!([
            {"action": "add", "task": {"id": "c", "title": "C", "description": "more"}, "reason": "discovered"},
            {"action": "remove", "task_id": "ghost", "reason": "obsolete"}
        ]))
        .expect("amendments");
        let agent = ScriptedAgent::new(vec![ScriptedReply::handoff(&handoff)]);
        let checks = ScriptedCheckRunner::passing();
        let events = RecordingEvents::default();

        let outcome = run(&mut fx, &agent, &checks, &events);
        assert!(matches!(
            outcome.verdict,
            IterationVerdict::Passed { amendments_accepted: 1, .. }
        ));
        let added = fx.plan.task("c").expect("added task");
        assert_eq!(added.max_retries, 5);
        assert_eq!(fx.plan.task("a").expect("a").status, TaskStatus::Done);
        assert!(fx.session.paths.plan_snapshot_path(1).exists());
        let audit = fs::read_to_string(&fx.session.paths.amendments_log_path).expect("audit");
        assert_eq!(audit.lines().count(), 2);
    }
}
