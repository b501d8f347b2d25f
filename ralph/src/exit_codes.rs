//! Stable exit codes for ralph CLI commands.

/// Command succeeded, the plan completed, or a task was selected.
pub const OK: i32 = 0;
/// Invalid layout/config/plan or any other error.
pub const INVALID: i32 = 1;
/// `ralph select` found nothing to do because the plan is complete.
pub const COMPLETE: i32 = 2;
/// No eligible task remains but the plan is not complete.
pub const BLOCKED: i32 = 3;
/// `ralph run` used up its iteration allowance.
pub const MAX_ITERATIONS: i32 = 4;
/// The run was interrupted (SIGINT).
pub const INTERRUPTED: i32 = 130;
