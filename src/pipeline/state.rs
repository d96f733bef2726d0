//! Run state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Loading,
    Filtering,
    Joining,
    Merging,
    Extracting,
    CleaningUp,
    Done,
    Failed,
}

impl RunState {
    /// Done and Failed accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// True while a stage is executing.
    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != RunState::Pending
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// A run leaves Pending for a stage state, moves between stage states as
    /// stages complete, and ends in Done (after at least one stage) or
    /// Failed (from anywhere non-terminal).
    pub fn can_transition_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunState::Pending => false,
            RunState::Failed => true,
            RunState::Done => self.is_running(),
            _ => true,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Loading => "loading",
            RunState::Filtering => "filtering",
            RunState::Joining => "joining",
            RunState::Merging => "merging",
            RunState::Extracting => "extracting",
            RunState::CleaningUp => "cleaning_up",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Invalid run state transition from '{from}' to '{to}'")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Current state plus every state the run has been in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    current: RunState,
    history: Vec<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Pending,
            history: vec![RunState::Pending],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to Failed unless the run already ended.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            self.current = RunState::Failed;
            self.history.push(RunState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_success_path() {
        let mut machine = StateMachine::new();
        for state in [
            RunState::Loading,
            RunState::Filtering,
            RunState::Joining,
            RunState::Merging,
            RunState::Extracting,
            RunState::CleaningUp,
            RunState::Done,
        ] {
            machine.transition(state).unwrap();
        }
        assert_eq!(machine.current(), RunState::Done);
        assert_eq!(machine.history().len(), 8);
    }

    #[test]
    fn test_failure_from_any_running_state() {
        let mut machine = StateMachine::new();
        machine.transition(RunState::Loading).unwrap();
        machine.transition(RunState::Failed).unwrap();
        assert!(machine.current().is_terminal());
        assert!(machine.transition(RunState::CleaningUp).is_err());
    }

    #[test]
    fn test_done_requires_a_stage() {
        let mut machine = StateMachine::new();
        let err = machine.transition(RunState::Done).unwrap_err();
        assert_eq!(err.from, RunState::Pending);
        assert!(err.to_string().contains("done"));
    }

    #[test]
    fn test_fail_is_idempotent_on_terminal() {
        let mut machine = StateMachine::new();
        machine.fail();
        machine.fail();
        assert_eq!(
            machine.history(),
            &[RunState::Pending, RunState::Failed]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::CleaningUp.to_string(), "cleaning_up");
        assert_eq!(RunState::Pending.to_string(), "pending");
    }
}
