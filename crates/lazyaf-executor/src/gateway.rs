//! Server-side runner protocol handling.
//!
//! The WebSocket route parses frames and hands them here; this module owns
//! the database transitions, the registry channels, and the death watchdog.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lazyaf_config::Settings;
use lazyaf_core::events::{Broadcaster, UiEvent};
use lazyaf_core::protocol::{BackendMessage, RunnerMessage};
use lazyaf_core::runner::{Labels, RunnerState};
use lazyaf_core::step::StepState;
use lazyaf_core::{ResourceId, Result};
use lazyaf_db::{LogStore, RunnerStore, StepStore};

use crate::registry::{RemoteOutcome, RunnerHandle, RunnerRegistry};

#[derive(Clone)]
pub struct RunnerGateway {
    registry: Arc<RunnerRegistry>,
    settings: Settings,
    steps: StepStore,
    runners: RunnerStore,
    logs: LogStore,
    broadcaster: Broadcaster,
}

impl RunnerGateway {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        settings: Settings,
        steps: StepStore,
        runners: RunnerStore,
        logs: LogStore,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            registry,
            settings,
            steps,
            runners,
            logs,
            broadcaster,
        }
    }

    /// Handle the registration frame: upsert the row, wire the send
    /// channel, and ACK.
    pub async fn handle_register(
        &self,
        runner_id: ResourceId,
        name: Option<&str>,
        runner_type: &str,
        labels: &Labels,
        websocket_id: &str,
        tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<()> {
        self.runners
            .register(runner_id, name, runner_type, labels, websocket_id)
            .await?;
        self.registry
            .insert(
                runner_id,
                RunnerHandle {
                    tx: tx.clone(),
                    runner_type: runner_type.to_string(),
                    labels: labels.clone(),
                },
            )
            .await;
        if tx.send(BackendMessage::RegisterAck { runner_id }).is_err() {
            return Err(lazyaf_core::Error::Protocol(
                "runner socket closed before register ACK".into(),
            ));
        }
        info!(runner = %runner_id, runner_type, "runner registered");
        self.broadcaster.send(UiEvent::RunnerStatus {
            runner_id,
            status: RunnerState::Idle.to_string(),
        });
        Ok(())
    }

    /// Dispatch one post-registration frame.
    pub async fn handle_message(&self, runner_id: ResourceId, msg: RunnerMessage) -> Result<()> {
        match msg {
            RunnerMessage::Register { .. } => {
                // Re-registration mid-session is a protocol violation; the
                // socket handler closes on it.
                Err(lazyaf_core::Error::Protocol("duplicate register frame".into()))
            }
            RunnerMessage::Ack { step_execution_id } => {
                self.registry.resolve_ack(step_execution_id, true).await;
                Ok(())
            }
            RunnerMessage::Reject {
                step_execution_id,
                reason,
            } => {
                debug!(step = %step_execution_id, %reason, "push rejected by runner");
                self.registry.resolve_ack(step_execution_id, false).await;
                Ok(())
            }
            RunnerMessage::Heartbeat {} => {
                self.runners.heartbeat(runner_id).await?;
                Ok(())
            }
            RunnerMessage::Log {
                step_execution_id,
                lines,
            } => {
                let pairs: Vec<(i64, String)> =
                    lines.into_iter().map(|l| (l.seq, l.content)).collect();
                let contents: Vec<String> =
                    pairs.iter().map(|(_, content)| content.clone()).collect();
                self.logs.append(step_execution_id, &pairs).await?;
                self.broadcaster.send(UiEvent::StepLogs {
                    step_execution_id,
                    lines: contents,
                });
                Ok(())
            }
            RunnerMessage::Status {
                step_execution_id,
                state,
                exit_code,
                message,
            } => {
                self.handle_status(runner_id, step_execution_id, state, exit_code, message)
                    .await
            }
            RunnerMessage::SnapshotReady { workspace_id, bytes } => {
                debug!(workspace = %workspace_id, bytes, "workspace snapshot uploaded");
                self.registry.resolve_snapshot(&workspace_id, Ok(())).await;
                Ok(())
            }
            RunnerMessage::SnapshotFailed {
                workspace_id,
                reason,
            } => {
                self.registry
                    .resolve_snapshot(&workspace_id, Err(reason))
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_status(
        &self,
        runner_id: ResourceId,
        step_execution_id: ResourceId,
        state: StepState,
        exit_code: Option<i32>,
        message: Option<String>,
    ) -> Result<()> {
        let row = self.steps.get(step_execution_id).await?;

        if state.is_terminal() {
            let moved = self
                .steps
                .transition(
                    step_execution_id,
                    &[StepState::Assigned, StepState::Preparing, StepState::Running],
                    state,
                    exit_code,
                    message.as_deref(),
                )
                .await?;
            if !moved {
                // Duplicate-completion guard: the row already advanced
                // (requeue, cancel, or an earlier report). Ignore.
                debug!(step = %step_execution_id, state = %state, "stale terminal report ignored");
                return Ok(());
            }
            self.broadcaster.send(UiEvent::StepStatus {
                pipeline_run_id: ResourceId::from(row.pipeline_run_id),
                step_execution_id,
                step_id: row.step_id.clone(),
                status: state.to_string(),
            });
            self.runners
                .transition(
                    runner_id,
                    &[RunnerState::Assigned, RunnerState::Busy],
                    RunnerState::Idle,
                )
                .await?;
            self.broadcaster.send(UiEvent::RunnerStatus {
                runner_id,
                status: RunnerState::Idle.to_string(),
            });
            self.registry
                .resolve_completion(step_execution_id, RemoteOutcome::Terminal { state, exit_code })
                .await;
        } else {
            let from: &[StepState] = match state {
                StepState::Preparing => &[StepState::Assigned],
                StepState::Running => &[StepState::Assigned, StepState::Preparing],
                _ => return Ok(()),
            };
            if self
                .steps
                .transition(step_execution_id, from, state, None, None)
                .await?
            {
                self.broadcaster.send(UiEvent::StepStatus {
                    pipeline_run_id: ResourceId::from(row.pipeline_run_id),
                    step_execution_id,
                    step_id: row.step_id,
                    status: state.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Socket closed. The row survives so reconnect recovery works; any
    /// in-flight step is requeued right away.
    pub async fn on_disconnect(&self, runner_id: ResourceId) {
        self.registry.remove(runner_id).await;
        if let Ok(record) = self.runners.get(runner_id).await {
            if let Some(step_id) = record.current_step_execution_id {
                let step_id = ResourceId::from(step_id);
                if let Ok(true) = self.steps.requeue(step_id).await {
                    warn!(runner = %runner_id, step = %step_id, "runner disconnected mid-job, step requeued");
                    self.registry
                        .resolve_completion(step_id, RemoteOutcome::Died)
                        .await;
                }
            }
        }
        if let Err(e) = self.runners.mark_disconnected(runner_id).await {
            warn!(runner = %runner_id, error = %e, "disconnect bookkeeping failed");
        }
        self.broadcaster.send(UiEvent::RunnerStatus {
            runner_id,
            status: RunnerState::Disconnected.to_string(),
        });
    }

    /// One pass of the death watchdog: bury working runners whose heartbeat
    /// expired and requeue their steps.
    pub async fn watchdog_tick(&self) -> Result<()> {
        let death_secs = self.settings.heartbeat_death_timeout.as_secs() as i64;
        let dead = self.runners.expire_dead(death_secs).await?;
        for record in dead {
            let runner_id = ResourceId::from(record.id);
            warn!(runner = %runner_id, "runner heartbeat expired, marking dead");
            self.registry.remove(runner_id).await;
            if let Some(step_id) = record.current_step_execution_id {
                let step_id = ResourceId::from(step_id);
                if let Ok(true) = self.steps.requeue(step_id).await {
                    info!(step = %step_id, "step requeued after runner death");
                    self.registry
                        .resolve_completion(step_id, RemoteOutcome::Died)
                        .await;
                }
            }
            self.broadcaster.send(UiEvent::RunnerStatus {
                runner_id,
                status: RunnerState::Dead.to_string(),
            });
        }
        Ok(())
    }

    /// Spawn the periodic watchdog task.
    pub fn spawn_watchdog(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.watchdog_tick().await {
                    warn!(error = %e, "runner watchdog tick failed");
                }
            }
        })
    }
}
