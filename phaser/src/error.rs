//! Error taxonomy for the phase engine.
//!
//! Functions return `anyhow::Result`; these types ride inside the `anyhow`
//! chain so callers can `downcast_ref` the category they care about.
//!
//! - [`EngineError`]: run-level conditions. Fatal to the current command.
//! - [`AttemptError`]: attempt-level conditions. Folded into the retry loop by
//!   the controller and never surfaced as run failures directly.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::state_machine::PhaseState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan directory not found: {0}")]
    PlanNotFound(PathBuf),

    #[error("run state {path} is unreadable or malformed: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("phase '{phase}' exhausted its retry budget after {attempts} failed attempts: {last_error}")]
    RetryBudgetExhausted {
        phase: String,
        attempts: u32,
        last_error: String,
    },

    #[error("a controller is already running for {plan}{}", running_pid(.pid))]
    ControllerAlreadyRunning { plan: PathBuf, pid: Option<u32> },

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("run is not initialized at {0} (run `phaser init` first)")]
    NotInitialized(PathBuf),

    #[error("run is already initialized at {0} (use `phaser reset` to start over)")]
    AlreadyInitialized(PathBuf),

    #[error("no phase is currently in progress")]
    NoCurrentPhase,

    #[error("invalid transition for phase '{phase}': {from} -> {to}")]
    InvalidTransition {
        phase: String,
        from: PhaseState,
        to: PhaseState,
    },
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("agent invocation timed out after {}s", .0.as_secs())]
    InvocationTimeout(Duration),

    #[error("agent process exited unsuccessfully (exit code {0:?})")]
    InvocationFailed(Option<i32>),

    #[error("agent protocol violation: {0}")]
    InvocationProtocolViolation(String),

    #[error("agent reported failure: {}", .0.join("; "))]
    AgentReportedFailure(Vec<String>),

    #[error("verification failed: {}", .0.join("; "))]
    VerificationFailure(Vec<String>),
}

fn running_pid(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

/// The attempt-level category of `err`, if it has one.
pub fn attempt_error(err: &anyhow::Error) -> Option<&AttemptError> {
    err.downcast_ref::<AttemptError>()
}
