//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components and the files
//! persisted under `.ralph/`. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a planned task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// True for statuses that count toward plan completion.
    pub fn is_settled(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Skipped)
    }
}

/// Retry budget given to tasks that do not declare one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A single unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub needs_docs: bool,
}

impl Task {
    /// Create a pending task with structural defaults.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            retry_count: 0,
            max_retries: default_max_retries(),
            acceptance_criteria: Vec::new(),
            skills: Vec::new(),
            libraries: Vec::new(),
            needs_docs: false,
        }
    }
}

/// Ordered task list. Plan order is the selection tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }
}

/// Completion report embedded in a handoff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub fully_complete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    High,
    Low,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_high(value: &Confidence) -> bool {
    *value == Confidence::High
}

/// Structured end-of-iteration report produced by the agent.
///
/// Handoffs are archived once per attempt and never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub summary: String,
    #[serde(default)]
    pub freeform: String,
    pub task_completed: TaskCompleted,
    #[serde(default)]
    pub deviations: Vec<String>,
    #[serde(default)]
    pub bugs_encountered: Vec<String>,
    #[serde(default)]
    pub architectural_notes: Vec<String>,
    #[serde(default)]
    pub constraints_discovered: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tests_added: Vec<String>,
    #[serde(default)]
    pub plan_amendments: Vec<PlanAmendment>,
    #[serde(default)]
    pub unfinished_business: Vec<String>,
    /// Set when the orchestrator built this handoff from a working-tree diff.
    #[serde(default, skip_serializing_if = "is_false")]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "is_high")]
    pub confidence: Confidence,
}

impl Handoff {
    /// Build a low-confidence handoff carrying only file-level facts.
    pub fn synthetic(task_id: &str, files_touched: Vec<String>) -> Self {
        let summary = format!(
            "Agent produced no structured handoff; {} file(s) changed in the working tree.",
            files_touched.len()
        );
        Self {
            summary: summary.clone(),
            freeform: String::new(),
            task_completed: TaskCompleted {
                task_id: task_id.to_string(),
                summary,
                fully_complete: false,
            },
            files_touched,
            synthetic: true,
            confidence: Confidence::Low,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmendmentAction {
    Add,
    Modify,
    Remove,
}

impl AmendmentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AmendmentAction::Add => "add",
            AmendmentAction::Modify => "modify",
            AmendmentAction::Remove => "remove",
        }
    }
}

/// Agent-proposed plan mutation.
///
/// `task` carries the full task body for `add`; `task_id` plus `changes`
/// address `modify` and `remove`. Bodies stay untyped until the guardrails
/// have checked them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAmendment {
    pub action: AmendmentAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Map<String, Value>>,
    #[serde(default)]
    pub reason: String,
    /// Insert position for `add`: the new task goes right after this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl PlanAmendment {
    /// Id this amendment targets, if one can be determined.
    pub fn target_id(&self) -> Option<&str> {
        if let Some(id) = self.task_id.as_deref() {
            return Some(id);
        }
        self.task
            .as_ref()
            .and_then(|task| task.get("id"))
            .and_then(Value::as_str)
    }
}

/// Operating mode of the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Handoffs only; compaction never runs.
    #[default]
    HandoffOnly,
    /// Handoffs plus the persistent knowledge index.
    HandoffPlusIndex,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::HandoffOnly => "handoff-only",
            Mode::HandoffPlusIndex => "handoff-plus-index",
        }
    }

    pub fn uses_knowledge_index(self) -> bool {
        self == Mode::HandoffPlusIndex
    }
}

/// Control loop state recorded in `state.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Complete,
    MaxIterationsReached,
    Interrupted,
    Blocked,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::MaxIterationsReached => "max_iterations_reached",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Active,
    Superseded,
}

/// One record of the machine-readable knowledge index.
///
/// Unknown fields are kept in `extra` so prior entries survive a
/// read/write cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
    #[serde(default)]
    pub memory_ids: Vec<String>,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub supersedes: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structured result the agent returns from a compaction request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeSummary {
    pub summary: String,
    #[serde(default)]
    pub new_memory_ids: Vec<String>,
    #[serde(default)]
    pub superseded_ids: Vec<String>,
}
