//! In-process registry of connected runners.
//!
//! This is the only state that does not live in the database; it is exactly
//! the set of live WebSocket connections and is rebuilt as runners
//! reconnect. Everything durable (assignments, heartbeats, step state) is
//! rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::debug;

use lazyaf_core::ResourceId;
use lazyaf_core::protocol::BackendMessage;
use lazyaf_core::runner::Labels;
use lazyaf_core::step::StepState;

/// Terminal signal for a remote execution.
#[derive(Debug, Clone, Copy)]
pub enum RemoteOutcome {
    /// The runner reported a terminal status.
    Terminal {
        state: StepState,
        exit_code: Option<i32>,
    },
    /// The runner died or disconnected; the step was requeued.
    Died,
}

/// Live connection to one runner.
#[derive(Clone)]
pub struct RunnerHandle {
    pub tx: mpsc::UnboundedSender<BackendMessage>,
    pub runner_type: String,
    pub labels: Labels,
}

#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<ResourceId, RunnerHandle>>,
    acks: Mutex<HashMap<ResourceId, oneshot::Sender<bool>>>,
    completions: Mutex<HashMap<ResourceId, oneshot::Sender<RemoteOutcome>>>,
    snapshots: Mutex<HashMap<String, oneshot::Sender<std::result::Result<(), String>>>>,
    /// Which runner last held each workspace, for cross-machine moves.
    workspace_locations: Mutex<HashMap<String, ResourceId>>,
}

impl RunnerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, runner_id: ResourceId, handle: RunnerHandle) {
        self.runners.write().await.insert(runner_id, handle);
    }

    pub async fn remove(&self, runner_id: ResourceId) {
        self.runners.write().await.remove(&runner_id);
    }

    pub async fn is_connected(&self, runner_id: ResourceId) -> bool {
        self.runners.read().await.contains_key(&runner_id)
    }

    /// Send a frame to a runner. False when it is not connected.
    pub async fn send(&self, runner_id: ResourceId, msg: BackendMessage) -> bool {
        match self.runners.read().await.get(&runner_id) {
            Some(handle) => handle.tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Arm the ACK channel before pushing, then await it with a deadline.
    pub async fn arm_ack(&self, step_execution_id: ResourceId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(step_execution_id, tx);
        rx
    }

    pub async fn resolve_ack(&self, step_execution_id: ResourceId, accepted: bool) {
        if let Some(tx) = self.acks.lock().await.remove(&step_execution_id) {
            let _ = tx.send(accepted);
        }
    }

    pub async fn wait_ack(
        &self,
        rx: oneshot::Receiver<bool>,
        step_execution_id: ResourceId,
        deadline: Duration,
    ) -> Option<bool> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(accepted)) => Some(accepted),
            _ => {
                self.acks.lock().await.remove(&step_execution_id);
                None
            }
        }
    }

    pub async fn arm_completion(
        &self,
        step_execution_id: ResourceId,
    ) -> oneshot::Receiver<RemoteOutcome> {
        let (tx, rx) = oneshot::channel();
        self.completions.lock().await.insert(step_execution_id, tx);
        rx
    }

    /// Fire the completion channel. Late duplicates find no receiver and
    /// fall through harmlessly.
    pub async fn resolve_completion(&self, step_execution_id: ResourceId, outcome: RemoteOutcome) {
        if let Some(tx) = self.completions.lock().await.remove(&step_execution_id) {
            let _ = tx.send(outcome);
        } else {
            debug!(step = %step_execution_id, "completion with no waiter (late report)");
        }
    }

    pub async fn take_completion(&self, step_execution_id: ResourceId) {
        self.completions.lock().await.remove(&step_execution_id);
    }

    pub async fn arm_snapshot(
        &self,
        workspace_id: &str,
    ) -> oneshot::Receiver<std::result::Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.snapshots.lock().await.insert(workspace_id.to_string(), tx);
        rx
    }

    pub async fn resolve_snapshot(
        &self,
        workspace_id: &str,
        result: std::result::Result<(), String>,
    ) {
        if let Some(tx) = self.snapshots.lock().await.remove(workspace_id) {
            let _ = tx.send(result);
        }
    }

    pub async fn record_workspace_location(&self, workspace_id: &str, runner_id: ResourceId) {
        self.workspace_locations
            .lock()
            .await
            .insert(workspace_id.to_string(), runner_id);
    }

    pub async fn workspace_location(&self, workspace_id: &str) -> Option<ResourceId> {
        self.workspace_locations.lock().await.get(workspace_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_round_trip() {
        let registry = RunnerRegistry::new();
        let step = ResourceId::new();
        let rx = registry.arm_ack(step).await;
        registry.resolve_ack(step, true).await;
        assert_eq!(
            registry.wait_ack(rx, step, Duration::from_secs(1)).await,
            Some(true)
        );
    }

    #[tokio::test]
    async fn ack_timeout_clears_the_channel() {
        let registry = RunnerRegistry::new();
        let step = ResourceId::new();
        let rx = registry.arm_ack(step).await;
        assert_eq!(
            registry.wait_ack(rx, step, Duration::from_millis(10)).await,
            None
        );
        // Late resolve is a no-op.
        registry.resolve_ack(step, true).await;
    }

    #[tokio::test]
    async fn late_completion_is_ignored() {
        let registry = RunnerRegistry::new();
        let step = ResourceId::new();
        // No waiter armed: a zombie's report falls through.
        registry
            .resolve_completion(
                step,
                RemoteOutcome::Terminal {
                    state: StepState::Completed,
                    exit_code: Some(0),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn send_to_unknown_runner_is_false() {
        let registry = RunnerRegistry::new();
        assert!(
            !registry
                .send(
                    ResourceId::new(),
                    BackendMessage::CancelStep {
                        step_execution_id: ResourceId::new()
                    }
                )
                .await
        );
    }
}
