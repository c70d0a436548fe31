//! Step configuration and the step execution state machine.

use std::collections::HashMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// The three step flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[display("agent")]
    Agent,
    #[display("script")]
    Script,
    #[display("docker")]
    Docker,
}

/// Type-tagged step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Script {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    Docker {
        image: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<String>,
    },
    Agent {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_ref: Option<String>,
        runner_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        agent_file_ids: Vec<ResourceId>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Script { .. } => StepKind::Script,
            StepConfig::Docker { .. } => StepKind::Docker,
            StepConfig::Agent { .. } => StepKind::Agent,
        }
    }
}

/// States of a single physical step execution.
///
/// `Pending` rows exist before anything touched a container; everything
/// after `Assigned` implies a runner or the local host accepted the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[display("pending")]
    Pending,
    #[display("assigned")]
    Assigned,
    #[display("preparing")]
    Preparing,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("timeout")]
    Timeout,
    #[display("cancelled")]
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Timeout | StepState::Cancelled
        )
    }

    /// Edge-condition outcome of a terminal state.
    pub fn outcome(&self) -> Option<StepOutcome> {
        match self {
            StepState::Completed => Some(StepOutcome::Success),
            StepState::Failed | StepState::Timeout | StepState::Cancelled => {
                Some(StepOutcome::Failure)
            }
            _ => None,
        }
    }

    /// Whether `next` is a legal successor. Terminal states accept nothing,
    /// which is what makes late duplicate completions a no-op.
    pub fn can_transition_to(&self, next: StepState) -> bool {
        use StepState::*;
        match self {
            Pending => matches!(next, Assigned | Preparing | Running | Failed | Cancelled),
            Assigned => matches!(next, Preparing | Running | Pending | Failed | Cancelled),
            Preparing => matches!(next, Running | Pending | Failed | Timeout | Cancelled),
            Running => matches!(next, Completed | Failed | Timeout | Cancelled | Pending),
            Completed | Failed | Timeout | Cancelled => false,
        }
    }

    pub fn parse(s: &str) -> Option<StepState> {
        use StepState::*;
        Some(match s {
            "pending" => Pending,
            "assigned" => Assigned,
            "preparing" => Preparing,
            "running" => Running,
            "completed" => Completed,
            "failed" => Failed,
            "timeout" => Timeout,
            "cancelled" => Cancelled,
            _ => return None,
        })
    }
}

/// Success/failure as seen by outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
}

/// The idempotency primitive: one physical attempt of one step of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    pub pipeline_run_id: ResourceId,
    pub step_index: u32,
    pub attempt: u32,
}

impl ExecutionKey {
    pub fn new(pipeline_run_id: ResourceId, step_index: u32, attempt: u32) -> Self {
        Self {
            pipeline_run_id,
            step_index,
            attempt,
        }
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.pipeline_run_id, self.step_index, self.attempt
        )
    }
}

impl std::str::FromStr for ExecutionKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let run = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| crate::Error::Validation(format!("bad execution key: {s}")))?;
        let idx = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| crate::Error::Validation(format!("bad execution key: {s}")))?;
        let attempt = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| crate::Error::Validation(format!("bad execution key: {s}")))?;
        Ok(Self {
            pipeline_run_id: run,
            step_index: idx,
            attempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [
            StepState::Completed,
            StepState::Failed,
            StepState::Timeout,
            StepState::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                StepState::Pending,
                StepState::Running,
                StepState::Completed,
                StepState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn running_can_requeue_to_pending() {
        // Runner death mid-job resets the execution for another runner.
        assert!(StepState::Running.can_transition_to(StepState::Pending));
    }

    #[test]
    fn outcome_mapping() {
        assert_eq!(StepState::Completed.outcome(), Some(StepOutcome::Success));
        assert_eq!(StepState::Timeout.outcome(), Some(StepOutcome::Failure));
        assert_eq!(StepState::Cancelled.outcome(), Some(StepOutcome::Failure));
        assert_eq!(StepState::Running.outcome(), None);
    }

    #[test]
    fn execution_key_round_trips() {
        let key = ExecutionKey::new(ResourceId::new(), 3, 1);
        let parsed: ExecutionKey = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn step_config_is_type_tagged() {
        let json = r#"{"type":"script","command":"echo hi"}"#;
        let config: StepConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), StepKind::Script);

        let json = r#"{"type":"agent","title":"Fix the bug","runner_type":"claude"}"#;
        let config: StepConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), StepKind::Agent);
    }
}
