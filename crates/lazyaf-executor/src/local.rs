//! Local Docker executor: runs a step as a container on the backend host.

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use lazyaf_config::Settings;
use lazyaf_core::control::StepControlConfig;
use lazyaf_core::events::{Broadcaster, UiEvent};
use lazyaf_core::execution::{ExecutionOutcome, ExecutionRequest, StepExecutor};
use lazyaf_core::step::{StepConfig, StepKind, StepState};
use lazyaf_core::workspace::{CONTROL_DIR, STEP_CONFIG_FILE};
use lazyaf_core::{Error, ResourceId, Result};
use lazyaf_db::{LogStore, StepExecutionRecord, StepStore, WorkspaceStore};

use crate::token;

/// Containers we own carry these labels so the recovery sweep can match
/// them back to execution rows.
pub const MANAGED_LABEL: &str = "lazyaf.managed";
pub const STEP_LABEL: &str = "lazyaf.step_execution_id";

const IMAGE_PULL_ATTEMPTS: usize = 3;
const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STOP_GRACE_SECS: i64 = 10;

pub struct LocalExecutor {
    docker: Docker,
    settings: Settings,
    steps: StepStore,
    logs: LogStore,
    workspaces: WorkspaceStore,
    broadcaster: Broadcaster,
}

impl LocalExecutor {
    pub fn new(
        settings: Settings,
        steps: StepStore,
        logs: LogStore,
        workspaces: WorkspaceStore,
        broadcaster: Broadcaster,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        Ok(Self {
            docker,
            settings,
            steps,
            logs,
            workspaces,
            broadcaster,
        })
    }

    pub fn with_client(
        docker: Docker,
        settings: Settings,
        steps: StepStore,
        logs: LogStore,
        workspaces: WorkspaceStore,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            docker,
            settings,
            steps,
            logs,
            workspaces,
            broadcaster,
        }
    }

    pub fn container_name(step_execution_id: ResourceId) -> String {
        format!("lazyaf-step-{step_execution_id}")
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=IMAGE_PULL_ATTEMPTS {
            let options = CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            };
            let mut stream = self.docker.create_image(Some(options), None, None);
            let mut failed = None;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image = %image, status = %status, "pull progress");
                        }
                    }
                    Err(e) => failed = Some(e.to_string()),
                }
            }
            match failed {
                None => return Ok(()),
                Some(e) => {
                    warn!(image = %image, attempt, error = %e, "image pull failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Resource(format!(
            "image pull failed for {image}: {}",
            last_err.unwrap_or_default()
        )))
    }

    /// Write `.control/step_config.json` into the workspace and record the
    /// token digest on the execution row.
    async fn materialize_control_file(&self, req: &ExecutionRequest) -> Result<String> {
        let step_token = token::generate();
        self.steps
            .set_token_digest(req.step_execution_id, &token::digest(&step_token))
            .await?;

        let control = StepControlConfig {
            step_execution_id: req.step_execution_id,
            step_token: step_token.clone(),
            callback_url: self.settings.public_url.clone(),
            heartbeat_interval_seconds: self.settings.heartbeat_interval.as_secs(),
            timeout_seconds: req.step.timeout_seconds,
            step: req.step.config.clone(),
        };

        let control_dir = self
            .settings
            .workspace_dir(&req.workspace_id)
            .join(CONTROL_DIR);
        tokio::fs::create_dir_all(&control_dir)
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        let path = control_dir.join(STEP_CONFIG_FILE);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        let body = serde_json::to_vec_pretty(&control)
            .map_err(|e| Error::Internal(e.to_string()))?;
        file.write_all(&body)
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        Ok(step_token)
    }

    async fn spawn_container(&self, req: &ExecutionRequest, image: &str) -> Result<String> {
        let name = Self::container_name(req.step_execution_id);
        let workspace_host = self.settings.workspace_dir(&req.workspace_id);
        let workspace_host = workspace_host.to_string_lossy().to_string();

        let mut env = vec![
            "HOME=/workspace/home".to_string(),
            format!("LAZYAF_STEP_EXECUTION_ID={}", req.step_execution_id),
        ];
        let mut binds = vec![format!("{workspace_host}:/workspace")];
        let mut cmd = None;

        if let StepConfig::Docker {
            command,
            env: step_env,
            volumes,
            ..
        } = &req.step.config
        {
            env.extend(step_env.iter().map(|(k, v)| format!("{k}={v}")));
            binds.extend(volumes.iter().cloned());
            if !command.is_empty() {
                cmd = Some(command.clone());
            }
        }

        let labels = [
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (STEP_LABEL.to_string(), req.step_execution_id.to_string()),
        ]
        .into_iter()
        .collect();

        let config = Config {
            image: Some(image.to_string()),
            cmd,
            env: Some(env),
            working_dir: Some("/workspace/repo".to_string()),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        info!(container = %name, image = %image, "creating step container");
        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("container create failed: {e}")))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("container start failed: {e}")))?;

        Ok(container.id)
    }

    /// Follow container logs into the log store. Only docker-kind steps are
    /// streamed here; script and agent containers report through the control
    /// layer, which owns their sequence numbers.
    fn spawn_log_stream(&self, req: &ExecutionRequest) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        let logs = self.logs.clone();
        let broadcaster = self.broadcaster.clone();
        let name = Self::container_name(req.step_execution_id);
        let step_execution_id = req.step_execution_id;

        tokio::spawn(async move {
            let start_seq = logs.max_seq(step_execution_id).await.ok().flatten();
            let mut seq = start_seq.map(|s| s + 1).unwrap_or(0);
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&name, Some(options));
            while let Some(result) = stream.next().await {
                let content = match result {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        String::from_utf8_lossy(&message).trim_end().to_string()
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(step = %step_execution_id, error = %e, "log stream error");
                        break;
                    }
                };
                if let Err(e) = logs.append(step_execution_id, &[(seq, content.clone())]).await {
                    warn!(step = %step_execution_id, error = %e, "log append failed");
                }
                broadcaster.send(UiEvent::StepLogs {
                    step_execution_id,
                    lines: vec![content],
                });
                seq += 1;
            }
        })
    }

    async fn run_container(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let image = crate::resolve_image(&self.settings, &req.step.config);
        self.materialize_control_file(req).await?;
        self.pull_image(&image).await?;

        let container_id = self.spawn_container(req, &image).await?;
        self.steps
            .set_container(req.step_execution_id, &container_id)
            .await?;
        self.transition_and_publish(req, &[StepState::Preparing], StepState::Running, None, None)
            .await?;

        let log_task = matches!(req.step.config.kind(), StepKind::Docker)
            .then(|| self.spawn_log_stream(req));

        let name = Self::container_name(req.step_execution_id);
        let timeout = Duration::from_secs(req.step.timeout_seconds);
        let mut wait = self.docker.wait_container(
            &name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let outcome = match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(response))) => {
                let exit_code = response.status_code as i32;
                let state = if exit_code == 0 {
                    StepState::Completed
                } else {
                    StepState::Failed
                };
                self.transition_and_publish(
                    req,
                    &[StepState::Preparing, StepState::Running],
                    state,
                    Some(exit_code),
                    None,
                )
                .await?;
                ExecutionOutcome {
                    state,
                    exit_code: Some(exit_code),
                }
            }
            Ok(Some(Err(e))) => {
                self.transition_and_publish(
                    req,
                    &[StepState::Preparing, StepState::Running],
                    StepState::Failed,
                    None,
                    Some(&format!("container wait failed: {e}")),
                )
                .await?;
                ExecutionOutcome::failed(None)
            }
            Ok(None) => {
                self.transition_and_publish(
                    req,
                    &[StepState::Preparing, StepState::Running],
                    StepState::Failed,
                    None,
                    Some("container wait stream ended"),
                )
                .await?;
                ExecutionOutcome::failed(None)
            }
            Err(_) => {
                // Deadline hit: SIGTERM, then SIGKILL after the grace period.
                info!(step = %req.step_execution_id, "step timed out, stopping container");
                let _ = self
                    .docker
                    .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await;
                self.transition_and_publish(
                    req,
                    &[StepState::Preparing, StepState::Running],
                    StepState::Timeout,
                    None,
                    Some("step timeout"),
                )
                .await?;
                ExecutionOutcome {
                    state: StepState::Timeout,
                    exit_code: None,
                }
            }
        };

        if let Some(task) = log_task {
            task.abort();
            let _ = task.await;
        }
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        // The control layer may have reported a terminal state before our
        // guarded transition; the row is authoritative either way.
        let row = self.steps.get(req.step_execution_id).await?;
        let state = row.state()?;
        if state.is_terminal() {
            Ok(ExecutionOutcome {
                state,
                exit_code: row.exit_code,
            })
        } else {
            Ok(outcome)
        }
    }

    /// Guarded transition plus UI event. A false return means someone else
    /// (usually the control layer) already advanced the row; that is fine.
    async fn transition_and_publish(
        &self,
        req: &ExecutionRequest,
        from: &[StepState],
        to: StepState,
        exit_code: Option<i32>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let moved = self
            .steps
            .transition(req.step_execution_id, from, to, exit_code, reason)
            .await?;
        if moved {
            self.broadcaster.send(UiEvent::StepStatus {
                pipeline_run_id: req.pipeline_run_id,
                step_execution_id: req.step_execution_id,
                step_id: req.step.id.clone(),
                status: to.to_string(),
            });
        }
        Ok(moved)
    }

    /// Attach to an execution another caller is driving: poll the row until
    /// it is terminal. Used for idempotent re-launch after restart.
    async fn attach(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let deadline = Duration::from_secs(req.step.timeout_seconds)
            + self.settings.heartbeat_death_timeout * 2;
        let started = tokio::time::Instant::now();
        loop {
            let row = self.steps.get(req.step_execution_id).await?;
            let state = row.state()?;
            if state.is_terminal() {
                return Ok(ExecutionOutcome {
                    state,
                    exit_code: row.exit_code,
                });
            }
            if started.elapsed() > deadline {
                self.transition_and_publish(
                    req,
                    &[StepState::Preparing, StepState::Running, StepState::Assigned],
                    StepState::Timeout,
                    None,
                    Some("attach deadline expired"),
                )
                .await?;
                return Ok(ExecutionOutcome {
                    state: StepState::Timeout,
                    exit_code: None,
                });
            }
            tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
        }
    }

    async fn stop_by_record(&self, record: &StepExecutionRecord) {
        let name = Self::container_name(ResourceId::from(record.id));
        let _ = self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await;
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

#[async_trait]
impl StepExecutor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionOutcome> {
        // Row-lock claim: exactly one caller moves pending → preparing.
        if !self.steps.claim_pending(req.step_execution_id).await? {
            let row = self.steps.get(req.step_execution_id).await?;
            let state = row.state()?;
            if state.is_terminal() {
                return Ok(ExecutionOutcome {
                    state,
                    exit_code: row.exit_code,
                });
            }
            debug!(step = %req.step_execution_id, "attaching to in-flight execution");
            return self.attach(&req).await;
        }

        let workspace = self.workspaces.acquire_shared(&req.workspace_id).await?;
        debug!(
            workspace = %workspace.id,
            use_count = workspace.use_count,
            "workspace acquired"
        );
        let result = self.run_container(&req).await;
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
        self.stop_by_record(&row).await;
        self.steps
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
        Ok(())
    }
}
