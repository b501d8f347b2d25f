//! Knowledge-index consolidation run at the top of an iteration.
//!
//! The agent rewrites the index files in place; the orchestrator snapshots
//! them durably first, discards any code changes the agent made, verifies the
//! rewrite, and restores the snapshot when verification fails.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::knowledge::verify_knowledge_update;
use crate::core::trigger::{CompactionTrigger, TriggerInputs, evaluate_trigger};
use crate::core::types::{KnowledgeSummary, Task};
use crate::io::agent::{AgentRequest, AgentRole, decode_result};
use crate::io::handoff_store::summaries;
use crate::io::knowledge_store::{read_knowledge, restore_knowledge, snapshot_knowledge};
use crate::io::prompt::{CompactionInputs, KnowledgeLocation, PromptBuilder};
use crate::io::run_state::{RunState, write_run_state};
use crate::io::schema::KNOWLEDGE_SUMMARY_SCHEMA;
use crate::session::{Collaborators, Session};

/// What happened when compaction was considered.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Wrong mode, no coding since the last compaction, or no rule fired.
    NotTriggered,
    /// A rule fired but no handoff is waiting to be consolidated.
    NothingToConsolidate { trigger: CompactionTrigger },
    Compacted {
        trigger: CompactionTrigger,
        handoffs: usize,
        summary: String,
    },
    /// Agent failure or invariant violation; the snapshot was restored.
    Failed {
        trigger: CompactionTrigger,
        violations: Vec<String>,
    },
}

/// Knowledge-index pointer paths relative to the project root.
pub fn knowledge_location(session: &Session) -> KnowledgeLocation {
    let relative = |path: &std::path::Path| {
        path.strip_prefix(&session.paths.root)
            .unwrap_or(path)
            .display()
            .to_string()
    };
    KnowledgeLocation {
        markdown: relative(&session.paths.knowledge_md_path),
        json: relative(&session.paths.knowledge_json_path),
    }
}

/// Evaluate the trigger for `task` and consolidate if it fires.
///
/// Only setup errors (snapshot, checkpoint, state writes) are returned as
/// `Err`; a failed consolidation is reported as [`CompactionOutcome::Failed`]
/// and the iteration carries on.
#[instrument(skip_all, fields(iteration, task_id = %task.id))]
pub fn maybe_compact(
    session: &Session,
    collab: Collaborators<'_>,
    state: &mut RunState,
    task: &Task,
    iteration: u32,
) -> Result<CompactionOutcome> {
    if !session.mode.uses_knowledge_index() || state.coding_iterations_since_compaction == 0 {
        return Ok(CompactionOutcome::NotTriggered);
    }

    let store = session.handoffs();
    let recent = summaries(&store.recent(session.config.compaction.novelty_window)?);
    let inputs = TriggerInputs {
        next_task: task,
        recent_summaries: &recent,
        handoff_bytes_since_compaction: state.total_handoff_bytes_since_compaction,
        coding_iterations_since_compaction: state.coding_iterations_since_compaction,
    };
    let Some(trigger) = evaluate_trigger(&inputs, &session.config.thresholds()) else {
        debug!("no compaction trigger fired");
        return Ok(CompactionOutcome::NotTriggered);
    };

    let pending = store.range(state.last_compaction_iteration, iteration)?;
    if pending.is_empty() {
        debug!(
            trigger = trigger.name(),
            "trigger fired but nothing to consolidate"
        );
        return Ok(CompactionOutcome::NothingToConsolidate { trigger });
    }

    info!(
        trigger = trigger.name(),
        handoffs = pending.len(),
        "compacting knowledge index"
    );
    collab.events.emit(
        "compaction_start",
        &format!("consolidating {} handoff(s)", pending.len()),
        json!({ "iteration": iteration, "trigger": trigger, "handoffs": pending.len() }),
    );

    let before = read_knowledge(&session.paths)?;
    snapshot_knowledge(&session.paths, iteration, &before)?;
    let checkpoint = collab.vcs.checkpoint()?;

    let location = knowledge_location(session);
    let prompt = PromptBuilder::new(session.config.context.budget_tokens).build_compaction(
        &CompactionInputs {
            iteration,
            handoffs: &pending,
            location: &location,
            markdown: &before.markdown,
            json: &before.json,
        },
    )?;
    let request = AgentRequest {
        workdir: session.paths.root.clone(),
        prompt,
        schema: KNOWLEDGE_SUMMARY_SCHEMA,
        role: AgentRole::Compaction,
        task_id: None,
        iteration,
        max_turns: session.config.agent.max_turns,
        timeout: session.config.agent_timeout(),
        output_limit_bytes: session.config.agent.output_limit_bytes,
        log_path: session.paths.compaction_log_path(iteration),
    };
    let result = collab.agent.invoke(&request).and_then(|envelope| {
        decode_result::<KnowledgeSummary>(&envelope, KNOWLEDGE_SUMMARY_SCHEMA, "knowledge summary")
    });

    // Compaction may only touch the index; anything else is discarded.
    collab.vcs.rollback(&checkpoint)?;

    let after = read_knowledge(&session.paths)?;
    let (violations, summary) = match result {
        Ok(summary) => (
            verify_knowledge_update(&before.markdown, &before.json, &after.markdown, &after.json),
            summary.summary,
        ),
        Err(err) => (
            vec![format!("compaction agent failed: {err:#}")],
            String::new(),
        ),
    };

    if !violations.is_empty() {
        warn!(violations = ?violations, "knowledge index update rejected, restoring snapshot");
        restore_knowledge(&session.paths, &before)?;
        collab.events.emit(
            "compaction_failed",
            "knowledge index update rejected",
            json!({ "iteration": iteration, "trigger": trigger, "violations": violations }),
        );
        return Ok(CompactionOutcome::Failed {
            trigger,
            violations,
        });
    }

    state.record_compaction(iteration);
    write_run_state(&session.paths.state_path, state)?;
    collab.events.emit(
        "compaction_end",
        &summary,
        json!({ "iteration": iteration, "trigger": trigger, "handoffs": pending.len() }),
    );
    Ok(CompactionOutcome::Compacted {
        trigger,
        handoffs: pending.len(),
        summary,
    })
}
