//! Pipeline run state machine.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// States of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[display("pending")]
    Pending,
    /// Workspace is being created.
    #[display("preparing")]
    Preparing,
    #[display("running")]
    Running,
    /// All steps done; merge/context-commit actions in flight.
    #[display("completing")]
    Completing,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match self {
            Pending => matches!(next, Preparing | Running | Failed | Cancelled),
            Preparing => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Completing | Completed | Failed | Cancelled),
            Completing => matches!(next, Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn parse(s: &str) -> Option<RunState> {
        use RunState::*;
        Some(match s {
            "pending" => Pending,
            "preparing" => Preparing,
            "running" => Running,
            "completing" => Completing,
            "completed" => Completed,
            "failed" => Failed,
            "cancelled" => Cancelled,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_states_do_not_regress() {
        assert!(RunState::Pending.can_transition_to(RunState::Preparing));
        assert!(RunState::Running.can_transition_to(RunState::Completing));
        assert!(!RunState::Completed.can_transition_to(RunState::Running));
        assert!(!RunState::Completing.can_transition_to(RunState::Running));
    }

    #[test]
    fn parse_matches_display() {
        for state in [
            RunState::Pending,
            RunState::Preparing,
            RunState::Running,
            RunState::Completing,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(&state.to_string()), Some(state));
        }
    }
}
