//! Prompt assembly for coding and compaction invocations.
//!
//! Templates render `## <Section>` blocks; empty sections are left out by
//! the templates themselves and the result is fitted to the token budget by
//! [`truncate_to_budget`]. Embedded text (task fields, handoffs, check
//! output, skills, index lines) goes through the `demote` filter so its own
//! `## ` lines never split a section.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::budget::{Truncated, demote_headings, truncate_to_budget};
use crate::core::knowledge::INDEX_HEADER;
use crate::core::types::{Handoff, Task};
use crate::io::skills::Skill;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const COMPACTION_TEMPLATE: &str = include_str!("prompts/compaction.md");

/// Cap on memory items pulled from the recent handoff window.
const MAX_MEMORY_ITEMS: usize = 20;

/// Where the full knowledge index lives, for the pointer section.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeLocation {
    pub markdown: String,
    pub json: String,
}

/// Everything the coding prompt is assembled from.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub iteration: u32,
    pub task: &'a Task,
    pub operator_notes: &'a [String],
    pub failure_context: Option<&'a str>,
    /// Recent handoffs, oldest first.
    pub recent_handoffs: &'a [(u32, Handoff)],
    /// Knowledge-index lines selected for this task.
    pub project_memory: &'a [String],
    /// Set in plus-index mode.
    pub knowledge: Option<&'a KnowledgeLocation>,
    pub skills: &'a [Skill],
}

#[derive(Debug, Serialize)]
struct PreviousHandoff<'a> {
    number: u32,
    summary: &'a str,
    freeform: &'a str,
}

#[derive(Debug, Serialize)]
struct CompactionHandoff<'a> {
    number: u32,
    summary: &'a str,
    constraints: &'a [String],
    notes: &'a [String],
    unfinished: &'a [String],
}

/// Everything the compaction prompt is assembled from.
#[derive(Debug, Clone)]
pub struct CompactionInputs<'a> {
    pub iteration: u32,
    pub handoffs: &'a [(u32, Handoff)],
    pub location: &'a KnowledgeLocation,
    pub markdown: &'a str,
    pub json: &'a str,
}

/// A rendered prompt ready to send to the agent.
#[derive(Debug, Clone)]
pub struct PromptPack {
    pub content: String,
    pub truncation: Truncated,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_filter("demote", |text: String| demote_headings(&text));
        env.add_template("iteration", ITERATION_TEMPLATE)?;
        env.add_template("compaction", COMPACTION_TEMPLATE)?;
        Ok(Self { env })
    }

    fn render_iteration(&self, input: &PromptInputs<'_>) -> Result<String> {
        let previous = input.recent_handoffs.last().map(|(number, handoff)| PreviousHandoff {
            number: *number,
            summary: handoff.summary.trim(),
            freeform: handoff.freeform.trim(),
        });
        let template = self.env.get_template("iteration")?;
        let rendered = template.render(context! {
            iteration => input.iteration,
            task => input.task,
            notes => input.operator_notes,
            failure => input.failure_context.map(str::trim).filter(|s| !s.is_empty()),
            memory => retrieved_memory(input.recent_handoffs),
            previous => previous,
            project_memory => input.project_memory,
            knowledge => input.knowledge,
            skills => input.skills,
        })?;
        Ok(collapse_blank_lines(&rendered))
    }

    fn render_compaction(&self, input: &CompactionInputs<'_>) -> Result<String> {
        let handoffs: Vec<CompactionHandoff<'_>> = input
            .handoffs
            .iter()
            .map(|(number, handoff)| CompactionHandoff {
                number: *number,
                summary: handoff.summary.trim(),
                constraints: &handoff.constraints_discovered,
                notes: &handoff.architectural_notes,
                unfinished: &handoff.unfinished_business,
            })
            .collect();
        let template = self.env.get_template("compaction")?;
        let rendered = template.render(context! {
            iteration => input.iteration,
            header => INDEX_HEADER,
            handoffs => handoffs,
            markdown_path => &input.location.markdown,
            json_path => &input.location.json,
            markdown => input.markdown.trim(),
            json => input.json.trim(),
        })?;
        Ok(collapse_blank_lines(&rendered))
    }
}

/// Constraints, architectural notes and unfinished business from the window,
/// newest first, de-duplicated.
fn retrieved_memory(handoffs: &[(u32, Handoff)]) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for (_, handoff) in handoffs.iter().rev() {
        let tagged = handoff
            .constraints_discovered
            .iter()
            .map(|item| format!("constraint: {}", item.trim()))
            .chain(
                handoff
                    .architectural_notes
                    .iter()
                    .map(|item| format!("note: {}", item.trim())),
            )
            .chain(
                handoff
                    .unfinished_business
                    .iter()
                    .map(|item| format!("unfinished: {}", item.trim())),
            );
        for item in tagged {
            if !items.contains(&item) {
                items.push(item);
            }
        }
    }
    items.truncate(MAX_MEMORY_ITEMS);
    items
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_string() + "\n"
}

/// Builds prompts within a token budget, evicting low-priority sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_tokens: usize,
}

impl PromptBuilder {
    pub fn new(budget_tokens: usize) -> Self {
        Self { budget_tokens }
    }

    pub fn build_iteration(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let rendered = PromptEngine::new()?.render_iteration(input)?;
        let truncation = truncate_to_budget(&rendered, self.budget_tokens);
        if truncation.was_truncated() {
            warn!(
                original_chars = truncation.original_chars,
                budget_chars = truncation.budget_chars,
                evicted = ?truncation.evicted,
                "prompt exceeded budget"
            );
        } else {
            debug!(chars = truncation.original_chars, "prompt within budget");
        }
        Ok(PromptPack {
            content: truncation.content.clone(),
            truncation,
        })
    }

    /// Compaction prompts carry the whole index and are not truncated.
    pub fn build_compaction(&self, input: &CompactionInputs<'_>) -> Result<String> {
        PromptEngine::new()?.render_compaction(input)
    }
}
