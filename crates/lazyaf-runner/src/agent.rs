//! Connection handling and job lifecycle for the runner agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use lazyaf_core::ResourceId;
use lazyaf_core::protocol::{
    BackendMessage, HEARTBEAT_INTERVAL_SECS, REGISTER_ACK_TIMEOUT_SECS, RunnerMessage,
};
use lazyaf_core::runner::Labels;
use lazyaf_core::step::StepState;

use crate::orchestrator::{self, JobSpec};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backend_ws: String,
    pub runner_id: ResourceId,
    pub name: Option<String>,
    pub runner_type: String,
    pub labels: Labels,
    pub workspace_base: PathBuf,
}

/// The single job slot. Pushes while busy are rejected.
struct ActiveJob {
    step_execution_id: ResourceId,
    task: tokio::task::JoinHandle<()>,
}

pub async fn connect_and_serve(config: &AgentConfig) -> anyhow::Result<()> {
    let (socket, _) = connect_async(&config.backend_ws).await?;
    let (mut write, mut read) = socket.split();

    let register = RunnerMessage::Register {
        runner_id: config.runner_id,
        name: config.name.clone(),
        runner_type: config.runner_type.clone(),
        labels: config.labels.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&register)?.into()))
        .await?;

    // Registration must be ACKed or the session is dead.
    let ack = tokio::time::timeout(
        Duration::from_secs(REGISTER_ACK_TIMEOUT_SECS),
        read.next(),
    )
    .await;
    match ack {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<BackendMessage>(&text) {
            Ok(BackendMessage::RegisterAck { .. }) => {
                info!("registered with backend");
            }
            Ok(other) => anyhow::bail!("expected register ACK, got {other:?}"),
            Err(e) => anyhow::bail!("bad register ACK: {e}"),
        },
        Ok(_) => anyhow::bail!("socket closed during registration"),
        Err(_) => anyhow::bail!("register ACK timeout"),
    }

    // Writer task: everything the job tasks emit goes through one channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RunnerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else { continue };
            if write.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let active: Arc<Mutex<Option<ActiveJob>>> = Arc::new(Mutex::new(None));

    let result = async {
        while let Some(frame) = read.next().await {
            let frame = frame?;
            let Message::Text(text) = frame else { continue };
            let msg: BackendMessage = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "unparseable backend frame");
                    continue;
                }
            };
            handle_backend_message(config, &out_tx, &active, msg).await;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // Session over: stop the writer; any in-flight job keeps the container
    // running, but the backend has already requeued the step.
    writer.abort();
    if let Some(job) = active.lock().await.take() {
        warn!(step = %job.step_execution_id, "abandoning job after disconnect");
        job.task.abort();
    }
    result
}

async fn handle_backend_message(
    config: &AgentConfig,
    out_tx: &mpsc::UnboundedSender<RunnerMessage>,
    active: &Arc<Mutex<Option<ActiveJob>>>,
    msg: BackendMessage,
) {
    match msg {
        BackendMessage::RegisterAck { .. } => {}
        BackendMessage::ExecuteStep {
            step_execution_id,
            image,
            step_config,
            timeout_seconds,
            workspace_id,
            workspace_snapshot_url,
            callback_url,
            step_token,
            heartbeat_interval_seconds,
        } => {
            let mut slot = active.lock().await;
            if let Some(job) = slot.as_ref() {
                if !job.task.is_finished() {
                    let _ = out_tx.send(RunnerMessage::Reject {
                        step_execution_id,
                        reason: "runner at capacity".into(),
                    });
                    return;
                }
            }
            let _ = out_tx.send(RunnerMessage::Ack { step_execution_id });

            let spec = JobSpec {
                step_execution_id,
                image,
                step_config,
                timeout: Duration::from_secs(timeout_seconds),
                workspace_id,
                workspace_snapshot_url,
                callback_url,
                step_token,
                workspace_base: config.workspace_base.clone(),
                runner_type: config.runner_type.clone(),
            };
            let heartbeat = Duration::from_secs(
                heartbeat_interval_seconds.max(1).min(HEARTBEAT_INTERVAL_SECS * 6),
            );
            let task = spawn_job(spec, heartbeat, out_tx.clone(), active.clone());
            *slot = Some(ActiveJob {
                step_execution_id,
                task,
            });
        }
        BackendMessage::CancelStep { step_execution_id } => {
            let mut slot = active.lock().await;
            if let Some(job) = slot.as_ref() {
                if job.step_execution_id == step_execution_id {
                    info!(step = %step_execution_id, "cancelling job");
                    job.task.abort();
                    orchestrator::force_stop(step_execution_id).await;
                    let _ = out_tx.send(RunnerMessage::Status {
                        step_execution_id,
                        state: StepState::Cancelled,
                        exit_code: None,
                        message: Some("cancelled by backend".into()),
                    });
                    *slot = None;
                }
            }
        }
        BackendMessage::SnapshotWorkspace {
            workspace_id,
            upload_url,
            max_bytes,
        } => {
            let out_tx = out_tx.clone();
            let base = config.workspace_base.clone();
            tokio::spawn(async move {
                match orchestrator::snapshot_workspace(&base, &workspace_id, &upload_url, max_bytes)
                    .await
                {
                    Ok(bytes) => {
                        let _ = out_tx.send(RunnerMessage::SnapshotReady {
                            workspace_id,
                            bytes,
                        });
                    }
                    Err(e) => {
                        let _ = out_tx.send(RunnerMessage::SnapshotFailed {
                            workspace_id,
                            reason: e.to_string(),
                        });
                    }
                }
            });
        }
    }
}

/// Run one job with its heartbeat ticker; clear the slot when done.
fn spawn_job(
    spec: JobSpec,
    heartbeat: Duration,
    out_tx: mpsc::UnboundedSender<RunnerMessage>,
    active: Arc<Mutex<Option<ActiveJob>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let step_execution_id = spec.step_execution_id;

        let hb_tx = out_tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            loop {
                ticker.tick().await;
                if hb_tx.send(RunnerMessage::Heartbeat {}).is_err() {
                    break;
                }
            }
        });

        let result = orchestrator::run_job(&spec, &out_tx).await;
        heartbeat_task.abort();

        match result {
            Ok(outcome) => {
                let _ = out_tx.send(RunnerMessage::Status {
                    step_execution_id,
                    state: outcome.state,
                    exit_code: outcome.exit_code,
                    message: outcome.message,
                });
            }
            Err(e) => {
                warn!(step = %step_execution_id, error = %e, "job failed");
                let _ = out_tx.send(RunnerMessage::Status {
                    step_execution_id,
                    state: StepState::Failed,
                    exit_code: None,
                    message: Some(e.to_string()),
                });
            }
        }
        // Only clear the slot if it still holds this job; a replacement may
        // already have been assigned.
        let mut slot = active.lock().await;
        if slot
            .as_ref()
            .is_some_and(|job| job.step_execution_id == step_execution_id)
        {
            *slot = None;
        }
    })
}
