//! Stable exit codes for phaser CLI commands.

/// Command succeeded, or the run completed every phase.
pub const OK: i32 = 0;
/// Invalid invocation, missing/corrupt plan or state, or any other error.
pub const INVALID: i32 = 1;
/// `phaser start` stopped because a phase exhausted its retry budget.
pub const PHASE_FAILED: i32 = 2;
/// Another live controller already holds the plan.
pub const ALREADY_RUNNING: i32 = 3;
