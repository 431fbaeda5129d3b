//! Per-phase lifecycle and its legal transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    Pending,
    Executing,
    Verifying,
    Fixing,
    Completed,
    Failed,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseState::Pending => "pending",
            PhaseState::Executing => "executing",
            PhaseState::Verifying => "verifying",
            PhaseState::Fixing => "fixing",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::Failed)
    }

    fn allowed_transitions(self) -> &'static [PhaseState] {
        match self {
            PhaseState::Pending => &[PhaseState::Executing, PhaseState::Failed],
            // Executing -> Executing re-enters implement after the invocation itself failed.
            PhaseState::Executing => &[
                PhaseState::Verifying,
                PhaseState::Executing,
                PhaseState::Failed,
            ],
            PhaseState::Verifying => &[
                PhaseState::Completed,
                PhaseState::Fixing,
                PhaseState::Failed,
            ],
            PhaseState::Fixing => &[PhaseState::Verifying, PhaseState::Failed],
            PhaseState::Completed | PhaseState::Failed => &[],
        }
    }

    pub fn can_transition(self, to: PhaseState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one phase through its lifecycle, rejecting illegal transitions.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase_id: String,
    state: PhaseState,
}

impl PhaseMachine {
    pub fn new(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            state: PhaseState::Pending,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn transition(&mut self, to: PhaseState) -> Result<PhaseState, EngineError> {
        if !self.state.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                phase: self.phase_id.clone(),
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}
