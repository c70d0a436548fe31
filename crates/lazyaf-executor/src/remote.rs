//! Remote executor: pushes a step to a connected runner and tracks its
//! life through the registry channels and the death watchdog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lazyaf_config::Settings;
use lazyaf_core::events::{Broadcaster, UiEvent};
use lazyaf_core::execution::{ExecutionOutcome, ExecutionRequest, StepExecutor};
use lazyaf_core::protocol::BackendMessage;
use lazyaf_core::runner::{Labels, RunnerState};
use lazyaf_core::step::StepState;
use lazyaf_core::{ResourceId, Result};
use lazyaf_db::{RunnerStore, StepStore, WorkspaceStore};

use crate::registry::{RemoteOutcome, RunnerRegistry};
use crate::token;

const SELECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(120);

pub struct RemoteExecutor {
    registry: Arc<RunnerRegistry>,
    settings: Settings,
    steps: StepStore,
    runners: RunnerStore,
    workspaces: WorkspaceStore,
    broadcaster: Broadcaster,
}

impl RemoteExecutor {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        settings: Settings,
        steps: StepStore,
        runners: RunnerStore,
        workspaces: WorkspaceStore,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            registry,
            settings,
            steps,
            runners,
            workspaces,
            broadcaster,
        }
    }

    /// Pick an idle, connected runner. A pinned id restricts the choice to
    /// exactly that runner; otherwise any runner satisfying the labels wins.
    async fn select_runner(
        &self,
        pinned: Option<ResourceId>,
        requirements: Option<&Labels>,
    ) -> Result<Option<ResourceId>> {
        let idle = self.runners.idle().await?;
        for record in idle {
            let runner_id = ResourceId::from(record.id);
            if let Some(pin) = pinned {
                if runner_id != pin {
                    continue;
                }
            }
            if !self.registry.is_connected(runner_id).await {
                continue;
            }
            if let Some(required) = requirements {
                if !record.label_set()?.satisfies(required) {
                    continue;
                }
            }
            return Ok(Some(runner_id));
        }
        Ok(None)
    }

    /// Cross-machine affinity move: ask the prior holder to snapshot the
    /// workspace so the next runner can download it. Same-runner transitions
    /// reuse the local volume; untraveled workspaces are served from the
    /// backend's own copy.
    async fn prepare_workspace_transfer(
        &self,
        workspace_id: &str,
        target: ResourceId,
    ) -> Option<String> {
        let download_url = format!(
            "{}/api/workspaces/{workspace_id}/snapshot",
            self.settings.public_url.trim_end_matches('/')
        );
        match self.registry.workspace_location(workspace_id).await {
            Some(prior) if prior == target => None,
            Some(prior) if self.registry.is_connected(prior).await => {
                let rx = self.registry.arm_snapshot(workspace_id).await;
                let sent = self
                    .registry
                    .send(
                        prior,
                        BackendMessage::SnapshotWorkspace {
                            workspace_id: workspace_id.to_string(),
                            upload_url: download_url.clone(),
                            max_bytes: self.settings.workspace_transfer_max_bytes,
                        },
                    )
                    .await;
                if !sent {
                    warn!(workspace = %workspace_id, "snapshot request not deliverable");
                    return Some(download_url);
                }
                match tokio::time::timeout(SNAPSHOT_DEADLINE, rx).await {
                    Ok(Ok(Ok(()))) => Some(download_url),
                    Ok(Ok(Err(reason))) => {
                        warn!(workspace = %workspace_id, %reason, "workspace snapshot failed");
                        Some(download_url)
                    }
                    _ => {
                        warn!(workspace = %workspace_id, "workspace snapshot timed out");
                        Some(download_url)
                    }
                }
            }
            _ => Some(download_url),
        }
    }

    async fn fail_step(&self, req: &ExecutionRequest, reason: &str) -> Result<ExecutionOutcome> {
        self.steps
            .transition(
                req.step_execution_id,
                &[
                    StepState::Pending,
                    StepState::Assigned,
                    StepState::Preparing,
                    StepState::Running,
                ],
                StepState::Failed,
                None,
                Some(reason),
            )
            .await?;
        self.broadcaster.send(UiEvent::StepStatus {
            pipeline_run_id: req.pipeline_run_id,
            step_execution_id: req.step_execution_id,
            step_id: req.step.id.clone(),
            status: StepState::Failed.to_string(),
        });
        Ok(ExecutionOutcome::failed(None))
    }

    /// Undo a claim that never reached the runner.
    async fn release_claim(&self, req: &ExecutionRequest, runner_id: ResourceId) {
        let _ = self.steps.requeue(req.step_execution_id).await;
        let _ = self
            .runners
            .transition(
                runner_id,
                &[RunnerState::Assigned, RunnerState::Busy],
                RunnerState::Idle,
            )
            .await;
    }
}

#[async_trait]
impl StepExecutor for RemoteExecutor {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionOutcome> {
        let row = self.steps.get(req.step_execution_id).await?;
        let state = row.state()?;
        if state.is_terminal() {
            return Ok(ExecutionOutcome {
                state,
                exit_code: row.exit_code,
            });
        }

        let workspace = self.workspaces.acquire_shared(&req.workspace_id).await?;
        debug!(workspace = %workspace.id, use_count = workspace.use_count, "workspace acquired");
        let result = self.push_loop(&req).await;
        if let Err(e) = self.workspaces.release_shared(&req.workspace_id).await {
            warn!(workspace = %req.workspace_id, error = %e, "workspace release failed");
        }
        result
    }

    async fn cancel(&self, step_execution_id: ResourceId) -> Result<()> {
        let row = self.steps.get(step_execution_id).await?;
        if row.state()?.is_terminal() {
            return Ok(());
        }
        if let Some(runner_id) = row.runner_id {
            let runner_id = ResourceId::from(runner_id);
            self.registry
                .send(runner_id, BackendMessage::CancelStep { step_execution_id })
                .await;
            let _ = self
                .runners
                .transition(
                    runner_id,
                    &[RunnerState::Assigned, RunnerState::Busy],
                    RunnerState::Idle,
                )
                .await;
        }
        let moved = self
            .steps
            .transition(
                step_execution_id,
                &[
                    StepState::Pending,
                    StepState::Assigned,
                    StepState::Preparing,
                    StepState::Running,
                ],
                StepState::Cancelled,
                None,
                Some("cancelled"),
            )
            .await?;
        if moved {
            self.registry
                .resolve_completion(
                    step_execution_id,
                    RemoteOutcome::Terminal {
                        state: StepState::Cancelled,
                        exit_code: None,
                    },
                )
                .await;
        }
        Ok(())
    }
}

impl RemoteExecutor {
    async fn push_loop(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let affinity_deadline = Instant::now() + self.settings.affinity_timeout;
        let completion_deadline = Duration::from_secs(req.step.timeout_seconds)
            + self.settings.heartbeat_death_timeout * 2;

        loop {
            // Terminal rows are returned as-is (idempotent re-entry).
            let row = self.steps.get(req.step_execution_id).await?;
            let state = row.state()?;
            if state.is_terminal() {
                return Ok(ExecutionOutcome {
                    state,
                    exit_code: row.exit_code,
                });
            }

            // A non-pending row whose runner is gone (e.g. after a backend
            // restart) is abandoned work; reclaim it. A connected runner is
            // still driving it, so just wait for its report.
            if matches!(
                state,
                StepState::Assigned | StepState::Preparing | StepState::Running
            ) {
                let driving = match row.runner_id {
                    Some(r) => self.registry.is_connected(ResourceId::from(r)).await,
                    None => false,
                };
                if driving {
                    tokio::time::sleep(SELECT_RETRY_INTERVAL).await;
                    continue;
                }
                let _ = self.steps.requeue(req.step_execution_id).await;
                continue;
            }

            if Instant::now() >= affinity_deadline {
                let reason = if req.pinned_runner_id.is_some() {
                    "pinned runner unavailable within affinity timeout"
                } else {
                    "no runner matched the step's label requirements"
                };
                return self.fail_step(req, reason).await;
            }

            let Some(runner_id) = self
                .select_runner(req.pinned_runner_id, req.step.requires.as_ref())
                .await?
            else {
                tokio::time::sleep(SELECT_RETRY_INTERVAL).await;
                continue;
            };

            // Claim: exactly one push wins this runner.
            if !self.runners.assign(runner_id, req.step_execution_id).await? {
                continue;
            }
            if !self
                .steps
                .transition(
                    req.step_execution_id,
                    &[StepState::Pending],
                    StepState::Assigned,
                    None,
                    None,
                )
                .await?
            {
                // Lost the step to another driver; undo the runner claim.
                let _ = self
                    .runners
                    .transition(runner_id, &[RunnerState::Assigned], RunnerState::Idle)
                    .await;
                continue;
            }
            self.steps
                .set_runner(req.step_execution_id, Some(runner_id))
                .await?;

            let snapshot_url = self
                .prepare_workspace_transfer(&req.workspace_id, runner_id)
                .await;

            let step_token = token::generate();
            self.steps
                .set_token_digest(req.step_execution_id, &token::digest(&step_token))
                .await?;

            let ack_rx = self.registry.arm_ack(req.step_execution_id).await;
            let completion_rx = self.registry.arm_completion(req.step_execution_id).await;

            let sent = self
                .registry
                .send(
                    runner_id,
                    BackendMessage::ExecuteStep {
                        step_execution_id: req.step_execution_id,
                        image: crate::resolve_image(&self.settings, &req.step.config),
                        step_config: req.step.config.clone(),
                        timeout_seconds: req.step.timeout_seconds,
                        workspace_id: req.workspace_id.clone(),
                        workspace_snapshot_url: snapshot_url,
                        callback_url: self.settings.public_url.clone(),
                        step_token,
                        heartbeat_interval_seconds: self.settings.heartbeat_interval.as_secs(),
                    },
                )
                .await;
            if !sent {
                self.registry.take_completion(req.step_execution_id).await;
                self.runners.mark_disconnected(runner_id).await?;
                self.release_claim(req, runner_id).await;
                continue;
            }

            info!(step = %req.step_execution_id, runner = %runner_id, "step pushed");

            match self
                .registry
                .wait_ack(ack_rx, req.step_execution_id, self.settings.ack_timeout)
                .await
            {
                Some(true) => {
                    self.runners
                        .transition(runner_id, &[RunnerState::Assigned], RunnerState::Busy)
                        .await?;
                }
                Some(false) => {
                    debug!(step = %req.step_execution_id, runner = %runner_id, "push rejected");
                    self.registry.take_completion(req.step_execution_id).await;
                    self.release_claim(req, runner_id).await;
                    continue;
                }
                None => {
                    // Missing ACK: the runner is suspect. Requeue and pick
                    // another; the runner re-registers if it is actually fine.
                    warn!(step = %req.step_execution_id, runner = %runner_id, "ACK timeout");
                    self.registry.take_completion(req.step_execution_id).await;
                    let _ = self.steps.requeue(req.step_execution_id).await;
                    self.runners.mark_disconnected(runner_id).await?;
                    self.registry.remove(runner_id).await;
                    continue;
                }
            }

            match tokio::time::timeout(completion_deadline, completion_rx).await {
                Ok(Ok(RemoteOutcome::Terminal { state, exit_code })) => {
                    self.registry
                        .record_workspace_location(&req.workspace_id, runner_id)
                        .await;
                    return Ok(ExecutionOutcome { state, exit_code });
                }
                Ok(Ok(RemoteOutcome::Died)) => {
                    // Watchdog or disconnect handler already requeued the
                    // step and buried the runner; go find another.
                    debug!(step = %req.step_execution_id, runner = %runner_id, "runner died mid-job");
                    continue;
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(step = %req.step_execution_id, "remote completion wait expired");
                    self.registry.take_completion(req.step_execution_id).await;
                    let _ = self.steps.requeue(req.step_execution_id).await;
                    let _ = self
                        .runners
                        .transition(
                            runner_id,
                            &[RunnerState::Assigned, RunnerState::Busy],
                            RunnerState::Idle,
                        )
                        .await;
                    continue;
                }
            }
        }
    }
}
