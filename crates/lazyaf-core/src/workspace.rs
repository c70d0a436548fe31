//! Workspace state machine and on-disk layout.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Subdirectories of every workspace.
pub const REPO_DIR: &str = "repo";
pub const HOME_DIR: &str = "home";
pub const CONTROL_DIR: &str = ".control";
pub const CONTEXT_DIR: &str = ".lazyaf-context";

/// Name of the control file materialized before each step.
pub const STEP_CONFIG_FILE: &str = "step_config.json";

/// Workspace id for a pipeline run. One run, one workspace.
pub fn workspace_id_for_run(pipeline_run_id: ResourceId) -> String {
    format!("ws-{pipeline_run_id}")
}

/// States of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    #[display("creating")]
    Creating,
    #[display("ready")]
    Ready,
    #[display("in_use")]
    InUse,
    #[display("cleaning")]
    Cleaning,
    #[display("destroyed")]
    Destroyed,
    #[display("failed")]
    Failed,
    /// Volume exists with no backing row, or row with no live run.
    #[display("orphaned")]
    Orphaned,
}

impl WorkspaceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkspaceState::Destroyed | WorkspaceState::Failed)
    }

    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        use WorkspaceState::*;
        match self {
            Creating => matches!(next, Ready | Failed),
            Ready => matches!(next, InUse | Cleaning | Orphaned),
            InUse => matches!(next, Ready | InUse | Orphaned),
            Cleaning => matches!(next, Destroyed | Failed),
            Orphaned => matches!(next, Cleaning | Destroyed),
            Destroyed | Failed => false,
        }
    }

    pub fn parse(s: &str) -> Option<WorkspaceState> {
        use WorkspaceState::*;
        Some(match s {
            "creating" => Creating,
            "ready" => Ready,
            "in_use" => InUse,
            "cleaning" => Cleaning,
            "destroyed" => Destroyed,
            "failed" => Failed,
            "orphaned" => Orphaned,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_only_from_quiescent_states() {
        assert!(WorkspaceState::Ready.can_transition_to(WorkspaceState::Cleaning));
        assert!(!WorkspaceState::InUse.can_transition_to(WorkspaceState::Cleaning));
        assert!(!WorkspaceState::Creating.can_transition_to(WorkspaceState::Cleaning));
    }

    #[test]
    fn workspace_id_shape() {
        let run = ResourceId::new();
        let id = workspace_id_for_run(run);
        assert!(id.starts_with("ws-"));
        assert!(id.contains(&run.to_string()));
    }
}
