//! The executor seam: what the pipeline executor hands to a backend.

use async_trait::async_trait;

use crate::pipeline::PipelineStep;
use crate::step::{ExecutionKey, StepState};
use crate::{ResourceId, Result};

/// Everything an executor needs to run one step execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub step_execution_id: ResourceId,
    pub execution_key: ExecutionKey,
    pub pipeline_run_id: ResourceId,
    pub workspace_id: String,
    pub step: PipelineStep,
    /// Set when a `continue_in_context` predecessor pinned the runner.
    pub pinned_runner_id: Option<ResourceId>,
}

/// Terminal result of one step execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome {
    pub state: StepState,
    pub exit_code: Option<i32>,
}

impl ExecutionOutcome {
    pub fn completed(exit_code: i32) -> Self {
        Self {
            state: StepState::Completed,
            exit_code: Some(exit_code),
        }
    }

    pub fn failed(exit_code: Option<i32>) -> Self {
        Self {
            state: StepState::Failed,
            exit_code,
        }
    }
}

/// A step execution backend. Implementations are idempotent on
/// `execution_key`: a second call attaches to the first.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive the execution to a terminal state and return it.
    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionOutcome>;

    /// Cooperative cancellation; idempotent.
    async fn cancel(&self, step_execution_id: ResourceId) -> Result<()>;
}
