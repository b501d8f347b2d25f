//! Test-only helpers: deterministic tasks and handoffs, a throwaway git
//! repository with `.ralph/` initialized, and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::types::{DEFAULT_MAX_RETRIES, Handoff, Plan, Task, TaskCompleted, TaskStatus};
use crate::core::verdict::Check;
use crate::io::agent::{Agent, AgentEnvelope, AgentRequest};
use crate::io::events::EventSink;
use crate::io::git::Git;
use crate::io::init::{InitOptions, RalphPaths, init_ralph};
use crate::io::plan_store::write_plan;
use crate::io::validation::{CheckRun, CheckRunner};
use crate::session::Session;

/// Create a pending task with deterministic text and no dependencies.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{} title", id),
        description: format!("{} description", id),
        status: TaskStatus::Pending,
        depends_on: Vec::new(),
        retry_count: 0,
        max_retries: DEFAULT_MAX_RETRIES,
        acceptance_criteria: Vec::new(),
        skills: Vec::new(),
        libraries: Vec::new(),
        needs_docs: false,
    }
}

pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        depends_on: deps.iter().map(|dep| dep.to_string()).collect(),
        ..task(id)
    }
}

pub fn plan_of(tasks: Vec<Task>) -> Plan {
    Plan {
        project: None,
        tasks,
    }
}

/// A complete, high-confidence handoff for `task_id`.
pub fn handoff_for(task_id: &str, summary: &str) -> Handoff {
    Handoff {
        summary: summary.to_string(),
        task_completed: TaskCompleted {
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            fully_complete: true,
        },
        ..Handoff::default()
    }
}

/// Session over `root` with default configuration and an unset interrupt flag.
pub fn test_session(root: &Path) -> Session {
    Session::new(
        RalphPaths::new(root),
        Default::default(),
        Arc::new(AtomicBool::new(false)),
    )
}

/// Temporary git repository with `.ralph/` initialized and committed.
pub struct TestRepo {
    dir: TempDir,
    git: Git,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let git = Git::new(dir.path());
        git.init()?;
        git.set_config("user.name", "Ralph Test")?;
        git.set_config("user.email", "ralph@example.com")?;
        git.set_config("commit.gpgsign", "false")?;
        init_ralph(dir.path(), &InitOptions { force: false })?;
        git.add_all()?;
        git.commit_staged("initial")?;
        Ok(Self { dir, git })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> RalphPaths {
        RalphPaths::new(self.root())
    }

    /// Stage and commit everything, succeeding even when nothing changed.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            self.git.commit_allow_empty(message)?;
        }
        Ok(())
    }

    pub fn last_commit_subject(&self) -> Result<String> {
        self.git.commit_subject("HEAD")
    }

    pub fn write_plan(&self, plan: &Plan) -> Result<()> {
        write_plan(&self.paths().plan_path, plan)
    }
}

/// One canned agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    result: Option<String>,
    error: Option<String>,
    writes: Vec<(String, String)>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl ScriptedReply {
    /// Successful envelope carrying raw `result` text.
    pub fn result(text: &str) -> Self {
        Self {
            result: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn handoff(handoff: &Handoff) -> Self {
        let text = serde_json::to_string(handoff).unwrap_or_default();
        Self::result(&text)
    }

    /// The invocation itself fails.
    pub fn failure(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Successful envelope without a result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Files (relative to the request workdir) written before replying.
    pub fn with_writes(mut self, writes: Vec<(&str, &str)>) -> Self {
        self.writes = writes
            .into_iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        self
    }

    /// Raise `flag` after the writes, as a signal arriving mid-invocation would.
    pub fn interrupting(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }
}

/// Agent that replays scripted replies in order and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: RefCell<VecDeque<ScriptedReply>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.replies.borrow().len();
        assert_eq!(left, 0, "{left} scripted replies were never used");
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentEnvelope> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no reply left"))?;

        for (relative, content) in &reply.writes {
            let path = request.workdir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(flag) = &reply.interrupt {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(reason) = reply.error {
            return Err(anyhow!(reason));
        }
        Ok(AgentEnvelope {
            kind: "result".to_string(),
            subtype: "success".to_string(),
            num_turns: 1,
            result: reply.result,
            ..AgentEnvelope::default()
        })
    }
}

/// Check runner that replays scripted results, passing once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedCheckRunner {
    runs: RefCell<VecDeque<CheckRun>>,
    calls: Cell<usize>,
}

impl ScriptedCheckRunner {
    pub fn new(runs: Vec<CheckRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            calls: Cell::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run_check(&self, _check: &Check, _workdir: &Path) -> CheckRun {
        self.calls.set(self.calls.get() + 1);
        self.runs.borrow_mut().pop_front().unwrap_or(CheckRun {
            exit_code: Some(0),
            output: String::new(),
        })
    }
}

/// Event sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: RefCell<Vec<(String, String, Value)>>,
}

impl RecordingEvents {
    pub fn names(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    /// Metadata of the first event called `name`.
    pub fn metadata(&self, name: &str) -> Option<Value> {
        self.events
            .borrow()
            .iter()
            .find(|(event, _, _)| event == name)
            .map(|(_, _, metadata)| metadata.clone())
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: &str, message: &str, metadata: Value) {
        self.events
            .borrow_mut()
            .push((event.to_string(), message.to_string(), metadata));
    }
}
