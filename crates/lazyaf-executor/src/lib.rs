//! Step execution backends.
//!
//! - LocalExecutor: containers on the host the backend controls
//! - RemoteExecutor: push over the runner WebSocket, tracked to completion
//!
//! Both are idempotent on the execution key: a second call for the same
//! key attaches to the first attempt instead of starting another.

pub mod gateway;
pub mod local;
pub mod recovery;
pub mod registry;
pub mod remote;
pub mod token;

pub use gateway::RunnerGateway;
pub use lazyaf_core::execution::{ExecutionOutcome, ExecutionRequest, StepExecutor};
pub use local::LocalExecutor;
pub use recovery::recover_local_containers;
pub use registry::{RemoteOutcome, RunnerRegistry};
pub use remote::RemoteExecutor;

use lazyaf_config::Settings;
use lazyaf_core::step::StepConfig;

/// Image for a step: script steps use the configured base image with the
/// control layer baked in, docker steps bring their own, agent steps map
/// through the runner type.
pub fn resolve_image(settings: &Settings, config: &StepConfig) -> String {
    match config {
        StepConfig::Script { .. } => settings.script_base_image.clone(),
        StepConfig::Docker { image, .. } => image.clone(),
        StepConfig::Agent { runner_type, .. } => match runner_type.as_str() {
            "gemini" => settings.agent_gemini_image.clone(),
            _ => settings.agent_claude_image.clone(),
        },
    }
}
