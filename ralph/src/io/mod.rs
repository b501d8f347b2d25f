//! I/O helpers for orchestrator commands.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod events;
pub mod files;
pub mod git;
pub mod handoff_store;
pub mod init;
pub mod knowledge_store;
pub mod plan_store;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod run_state;
pub mod schema;
pub mod skills;
pub mod validation;
