//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod amendments;
pub mod budget;
pub mod classifier;
pub mod invariants;
pub mod knowledge;
pub mod retrieval;
pub mod selector;
pub mod state_update;
pub mod terms;
pub mod trigger;
pub mod types;
pub mod verdict;
