//! Realtime events fanned out to UI WebSocket clients.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::ResourceId;

/// Broadcast event sent to UI clients. State transitions are monotonic per
/// entity; the emitting side only publishes after the guarded transition
/// commits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    CardUpdated {
        card_id: ResourceId,
        status: String,
    },
    JobStatus {
        job_id: ResourceId,
        status: String,
    },
    RunnerStatus {
        runner_id: ResourceId,
        status: String,
    },
    StepStatus {
        pipeline_run_id: ResourceId,
        step_execution_id: ResourceId,
        step_id: String,
        status: String,
    },
    StepLogs {
        step_execution_id: ResourceId,
        lines: Vec<String>,
    },
    PipelineRunStatus {
        pipeline_run_id: ResourceId,
        status: String,
        steps_completed: u32,
        steps_total: u32,
    },
    DebugBreakpoint {
        step_execution_id: ResourceId,
        session_id: ResourceId,
    },
}

impl UiEvent {
    /// Channel name used for client-side subscription filtering.
    pub fn channel(&self) -> String {
        match self {
            UiEvent::CardUpdated { card_id, .. } => format!("card:{card_id}"),
            UiEvent::JobStatus { job_id, .. } => format!("job:{job_id}"),
            UiEvent::RunnerStatus { runner_id, .. } => format!("runner:{runner_id}"),
            UiEvent::StepStatus { pipeline_run_id, .. }
            | UiEvent::PipelineRunStatus { pipeline_run_id, .. } => {
                format!("run:{pipeline_run_id}")
            }
            UiEvent::StepLogs { step_execution_id, .. }
            | UiEvent::DebugBreakpoint { step_execution_id, .. } => {
                format!("step:{step_execution_id}")
            }
        }
    }
}

/// Fan-out sender for UI events. Cloneable; dropping every receiver is fine.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<UiEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send to all connected clients. Errors (no receivers) are ignored.
    pub fn send(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_snake_case_tagged() {
        let event = UiEvent::PipelineRunStatus {
            pipeline_run_id: ResourceId::new(),
            status: "running".into(),
            steps_completed: 1,
            steps_total: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"pipeline_run_status""#));
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe();
        b.send(UiEvent::RunnerStatus {
            runner_id: ResourceId::new(),
            status: "idle".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel().starts_with("runner:"), true);
    }
}
