//! One store per entity. All state transitions are guarded UPDATEs
//! (`WHERE status IN (...)`) so late or duplicate reports are no-ops.

pub mod cards;
pub mod jobs;
pub mod logs;
pub mod pipelines;
pub mod repos;
pub mod runners;
pub mod runs;
pub mod steps;
pub mod triggers;
pub mod workspaces;

pub use cards::{CardRecord, CardStore};
pub use jobs::{JobRecord, JobStore};
pub use logs::{LogStore, StepLogRecord};
pub use pipelines::{PipelineRecord, PipelineStore};
pub use repos::{RepoRecord, RepoStore};
pub use runners::{RunnerRecord, RunnerStore};
pub use runs::{PipelineRunRecord, RunStore};
pub use steps::{StepExecutionRecord, StepRunRecord, StepStore};
pub use triggers::TriggerStore;
pub use workspaces::{WorkspaceRecord, WorkspaceStore};
