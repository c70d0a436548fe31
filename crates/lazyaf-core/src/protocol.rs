//! Runner wire protocol: JSON frames over the runner WebSocket.
//!
//! Registration is the first frame and must be ACKed within
//! `register_ack_timeout` or the socket is closed. Every `execute_step`
//! requires an `ack` within `ack_timeout`; death is declared after
//! `heartbeat_death_timeout` without a heartbeat from a working runner.

use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::runner::Labels;
use crate::step::{StepConfig, StepState};

/// Default cadences and deadlines, all overridable through settings.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const HEARTBEAT_DEATH_TIMEOUT_SECS: u64 = 30;
pub const ACK_TIMEOUT_SECS: u64 = 5;
pub const REGISTER_ACK_TIMEOUT_SECS: u64 = 10;

/// One log line with its monotonic sequence number. Delivery is
/// at-least-once; the backend dedups by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatchLine {
    pub seq: i64,
    pub content: String,
}

/// Frames sent by a runner to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// First frame on connect.
    Register {
        runner_id: ResourceId,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        runner_type: String,
        #[serde(default)]
        labels: Labels,
    },
    /// Acceptance of a pushed step.
    Ack { step_execution_id: ResourceId },
    /// Refusal of a pushed step (e.g. no capacity).
    Reject {
        step_execution_id: ResourceId,
        reason: String,
    },
    Status {
        step_execution_id: ResourceId,
        state: StepState,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        step_execution_id: ResourceId,
        lines: Vec<LogBatchLine>,
    },
    Heartbeat {},
    /// Workspace archive uploaded; the next runner may fetch it.
    SnapshotReady {
        workspace_id: String,
        bytes: u64,
    },
    SnapshotFailed {
        workspace_id: String,
        reason: String,
    },
}

/// Frames sent by the backend to a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
    RegisterAck { runner_id: ResourceId },
    ExecuteStep {
        step_execution_id: ResourceId,
        image: String,
        step_config: StepConfig,
        timeout_seconds: u64,
        workspace_id: String,
        /// Present when the workspace must be fetched from another machine.
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_snapshot_url: Option<String>,
        /// Where the in-container control layer reports back to.
        callback_url: String,
        step_token: String,
        heartbeat_interval_seconds: u64,
    },
    CancelStep { step_execution_id: ResourceId },
    /// Archive the named workspace and upload it to `upload_url`.
    SnapshotWorkspace {
        workspace_id: String,
        upload_url: String,
        max_bytes: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_type_tagged() {
        let msg = RunnerMessage::Heartbeat {};
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"heartbeat""#));

        let msg = RunnerMessage::Register {
            runner_id: ResourceId::new(),
            name: Some("pi-1".into()),
            runner_type: "docker".into(),
            labels: Labels::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RunnerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, RunnerMessage::Register { .. }));
    }

    #[test]
    fn execute_step_round_trips() {
        let msg = BackendMessage::ExecuteStep {
            step_execution_id: ResourceId::new(),
            image: "alpine:latest".into(),
            step_config: StepConfig::Script {
                command: "echo hi".into(),
                working_dir: None,
            },
            timeout_seconds: 300,
            workspace_id: "ws-abc".into(),
            workspace_snapshot_url: None,
            callback_url: "http://backend:3000".into(),
            step_token: "tok".into(),
            heartbeat_interval_seconds: 10,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"execute_step""#));
        // Optional snapshot url is omitted entirely.
        assert!(!json.contains("workspace_snapshot_url"));
        let back: BackendMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, BackendMessage::ExecuteStep { .. }));
    }

    #[test]
    fn status_carries_step_state() {
        let json = r#"{"type":"status","step_execution_id":"00000000-0000-7000-8000-000000000000","state":"running"}"#;
        let msg: RunnerMessage = serde_json::from_str(json).unwrap();
        match msg {
            RunnerMessage::Status { state, exit_code, .. } => {
                assert_eq!(state, StepState::Running);
                assert_eq!(exit_code, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
