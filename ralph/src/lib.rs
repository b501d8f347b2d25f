//! Transactional orchestrator that drives an external coding agent through a
//! task plan.
//!
//! Every iteration selects one task, checkpoints the working tree, invokes
//! the agent, validates the result, and then either commits or rolls back.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, amendments, verdicts,
//!   compaction triggers, knowledge verification, budgeting). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution, agent invocation). Behind traits so tests can script them.
//!
//! Orchestration modules ([`step`], [`compaction`], [`looping`], [`start`],
//! [`select`], [`validate`]) coordinate core logic with I/O to implement CLI
//! commands.

pub mod compaction;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod session;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
