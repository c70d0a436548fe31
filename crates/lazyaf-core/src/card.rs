//! Card status as seen by trigger actions and the job path.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Kanban card status. Transitions are driven by the executor (standalone
/// jobs) or by a pipeline trigger action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    #[display("todo")]
    Todo,
    #[display("in_progress")]
    InProgress,
    #[display("in_review")]
    InReview,
    #[display("done")]
    Done,
    #[display("failed")]
    Failed,
}

impl CardStatus {
    pub fn parse(s: &str) -> Option<CardStatus> {
        use CardStatus::*;
        Some(match s {
            "todo" => Todo,
            "in_progress" => InProgress,
            "in_review" => InReview,
            "done" => Done,
            "failed" => Failed,
            _ => return None,
        })
    }
}

/// Job status for the standalone-card path. Internally a degenerate
/// pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        use JobStatus::*;
        Some(match s {
            "queued" => Queued,
            "running" => Running,
            "completed" => Completed,
            "failed" => Failed,
            _ => return None,
        })
    }
}
