//! Per-step lifecycle

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Where a migration step is in its run.
///
/// `NotStarted -> Probing -> {AlreadyApplied | Skipped | Applying -> {Applied | FailedRolledBack}}`.
/// There is no partially-applied terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    NotStarted,
    Probing,
    AlreadyApplied,
    /// Precondition missing (source table or column absent)
    Skipped,
    Applying,
    Applied,
    FailedRolledBack,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("illegal step transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: StepState,
    pub to: StepState,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::AlreadyApplied
                | StepState::Skipped
                | StepState::Applied
                | StepState::FailedRolledBack
        )
    }

    pub fn can_advance_to(&self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (NotStarted, Probing)
                | (Probing, AlreadyApplied)
                | (Probing, Skipped)
                | (Probing, Applying)
                | (Probing, FailedRolledBack)
                | (Applying, Applied)
                | (Applying, FailedRolledBack)
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::NotStarted => "not started",
            StepState::Probing => "probing",
            StepState::AlreadyApplied => "already applied",
            StepState::Skipped => "skipped",
            StepState::Applying => "applying",
            StepState::Applied => "applied",
            StepState::FailedRolledBack => "failed (rolled back)",
        };
        f.write_str(s)
    }
}

/// Enforces legal transitions and remembers the path taken
#[derive(Debug, Clone)]
pub struct StepTracker {
    state: StepState,
    history: Vec<StepState>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self {
            state: StepState::NotStarted,
            history: vec![StepState::NotStarted],
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn history(&self) -> &[StepState] {
        &self.history
    }

    pub fn advance(&mut self, next: StepState) -> Result<StepState, InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}
