//! Contract between the backend and the in-container control layer.

use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::step::StepConfig;

/// Written to `/workspace/.control/step_config.json` before the step
/// container starts. The control shim reads it at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepControlConfig {
    pub step_execution_id: ResourceId,
    /// Single-use bearer token for the step control endpoints.
    pub step_token: String,
    /// Base URL of the backend, e.g. `http://backend:3000`.
    pub callback_url: String,
    pub heartbeat_interval_seconds: u64,
    pub timeout_seconds: u64,
    /// The payload to run.
    pub step: StepConfig,
}

/// Body of `POST /api/steps/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /api/steps/{id}/logs`. Lines carry monotonic sequence
/// numbers so redelivery dedups cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReport {
    pub lines: Vec<LogReportLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReportLine {
    pub seq: i64,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_config_round_trips() {
        let config = StepControlConfig {
            step_execution_id: ResourceId::new(),
            step_token: "secret".into(),
            callback_url: "http://backend:3000".into(),
            heartbeat_interval_seconds: 10,
            timeout_seconds: 300,
            step: StepConfig::Script {
                command: "echo hi".into(),
                working_dir: None,
            },
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: StepControlConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_token, "secret");
        assert_eq!(back.step, config.step);
    }
}
