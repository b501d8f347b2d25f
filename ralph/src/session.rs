//! Explicit orchestrator context threaded through the control loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::classifier::CheckClassifier;
use crate::core::types::Mode;
use crate::io::agent::Agent;
use crate::io::checkpoint::VersionControl;
use crate::io::config::RalphConfig;
use crate::io::events::EventSink;
use crate::io::handoff_store::HandoffStore;
use crate::io::init::RalphPaths;
use crate::io::validation::CheckRunner;

/// Per-invocation state owned by the loop.
///
/// `paused` and `operator_notes` are written only by the loop while it
/// applies control commands; `interrupt` is shared with the signal handler.
#[derive(Debug)]
pub struct Session {
    pub paths: RalphPaths,
    pub config: RalphConfig,
    pub mode: Mode,
    pub max_iterations: u32,
    pub dry_run: bool,
    pub paused: bool,
    /// Notes injected by the operator, drained into the next prompt.
    pub operator_notes: Vec<String>,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    pub fn new(paths: RalphPaths, config: RalphConfig, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            mode: config.mode,
            max_iterations: config.max_iterations,
            paths,
            config,
            dry_run: false,
            paused: false,
            operator_notes: Vec::new(),
            interrupt,
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Flag an interrupt from inside the process (tests, fatal paths).
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn handoffs(&self) -> HandoffStore {
        HandoffStore::new(&self.paths.handoffs_dir)
    }
}

/// Injected collaborators for the side-effecting seams of an iteration.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub agent: &'a dyn Agent,
    pub checks: &'a dyn CheckRunner,
    pub vcs: &'a dyn VersionControl,
    pub events: &'a dyn EventSink,
    pub classifier: &'a dyn CheckClassifier,
}
