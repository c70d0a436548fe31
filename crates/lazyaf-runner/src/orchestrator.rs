//! Step orchestration on the runner host: Docker containers, or native
//! subprocesses where containers are unavailable (e.g. GPIO hardware).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lazyaf_core::ResourceId;
use lazyaf_core::control::StepControlConfig;
use lazyaf_core::protocol::{LogBatchLine, RunnerMessage};
use lazyaf_core::step::{StepConfig, StepKind, StepState};
use lazyaf_core::workspace::{CONTEXT_DIR, CONTROL_DIR, HOME_DIR, REPO_DIR, STEP_CONFIG_FILE};

const STOP_GRACE_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub step_execution_id: ResourceId,
    pub image: String,
    pub step_config: StepConfig,
    pub timeout: Duration,
    pub workspace_id: String,
    pub workspace_snapshot_url: Option<String>,
    pub callback_url: String,
    pub step_token: String,
    pub workspace_base: PathBuf,
    pub runner_type: String,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

fn container_name(step_execution_id: ResourceId) -> String {
    format!("lazyaf-runner-step-{step_execution_id}")
}

/// Execute one pushed step to completion.
pub async fn run_job(
    spec: &JobSpec,
    out_tx: &mpsc::UnboundedSender<RunnerMessage>,
) -> anyhow::Result<JobOutcome> {
    let _ = out_tx.send(RunnerMessage::Status {
        step_execution_id: spec.step_execution_id,
        state: StepState::Preparing,
        exit_code: None,
        message: None,
    });

    let workspace = prepare_workspace(spec).await?;
    write_control_file(spec, &workspace).await?;

    let _ = out_tx.send(RunnerMessage::Status {
        step_execution_id: spec.step_execution_id,
        state: StepState::Running,
        exit_code: None,
        message: None,
    });

    match spec.runner_type.as_str() {
        "native" => run_native(spec, &workspace).await,
        _ => run_docker(spec, &workspace, out_tx).await,
    }
}

/// Materialize (or refresh) the runner-local workspace copy.
async fn prepare_workspace(spec: &JobSpec) -> anyhow::Result<PathBuf> {
    let dir = spec.workspace_base.join(&spec.workspace_id);
    if let Some(url) = &spec.workspace_snapshot_url {
        info!(workspace = %spec.workspace_id, "downloading workspace snapshot");
        let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        let archive = spec
            .workspace_base
            .join(format!("{}.tar.gz", spec.workspace_id));
        tokio::fs::write(&archive, &bytes).await?;
        let output = tokio::process::Command::new("tar")
            .arg("-xzf")
            .arg(&archive)
            .arg("-C")
            .arg(&dir)
            .output()
            .await?;
        let _ = tokio::fs::remove_file(&archive).await;
        if !output.status.success() {
            anyhow::bail!(
                "snapshot unpack failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    for sub in [REPO_DIR, HOME_DIR, CONTROL_DIR, CONTEXT_DIR] {
        tokio::fs::create_dir_all(dir.join(sub)).await?;
    }
    Ok(dir)
}

async fn write_control_file(spec: &JobSpec, workspace: &Path) -> anyhow::Result<()> {
    let control = StepControlConfig {
        step_execution_id: spec.step_execution_id,
        step_token: spec.step_token.clone(),
        callback_url: spec.callback_url.clone(),
        heartbeat_interval_seconds: lazyaf_core::protocol::HEARTBEAT_INTERVAL_SECS,
        timeout_seconds: spec.timeout.as_secs(),
        step: spec.step_config.clone(),
    };
    let path = workspace.join(CONTROL_DIR).join(STEP_CONFIG_FILE);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&control)?).await?;
    Ok(())
}

async fn run_docker(
    spec: &JobSpec,
    workspace: &Path,
    out_tx: &mpsc::UnboundedSender<RunnerMessage>,
) -> anyhow::Result<JobOutcome> {
    let docker = Docker::connect_with_local_defaults()?;
    let name = container_name(spec.step_execution_id);

    // Pull first; progress is noise at this level.
    let mut pull = docker.create_image(
        Some(CreateImageOptions {
            from_image: spec.image.clone(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(event) = pull.next().await {
        if let Err(e) = event {
            warn!(image = %spec.image, error = %e, "pull warning");
        }
    }

    let mut env = vec![
        "HOME=/workspace/home".to_string(),
        format!("LAZYAF_STEP_EXECUTION_ID={}", spec.step_execution_id),
    ];
    let mut binds = vec![format!("{}:/workspace", workspace.to_string_lossy())];
    let mut cmd = None;
    if let StepConfig::Docker {
        command,
        env: step_env,
        volumes,
        ..
    } = &spec.step_config
    {
        env.extend(step_env.iter().map(|(k, v)| format!("{k}={v}")));
        binds.extend(volumes.iter().cloned());
        if !command.is_empty() {
            cmd = Some(command.clone());
        }
    }

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            Config {
                image: Some(spec.image.clone()),
                cmd,
                env: Some(env),
                working_dir: Some("/workspace/repo".to_string()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(false),
                host_config: Some(HostConfig {
                    binds: Some(binds),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await?;
    docker
        .start_container(&name, None::<StartContainerOptions<String>>)
        .await?;

    // Docker-kind steps have no control layer inside; stream their logs
    // over the socket. Script and agent containers report directly.
    let log_task = if spec.step_config.kind() == StepKind::Docker {
        let docker = docker.clone();
        let name = name.clone();
        let out_tx = out_tx.clone();
        let step_execution_id = spec.step_execution_id;
        Some(tokio::spawn(async move {
            let mut seq = 0i64;
            let mut stream = docker.logs(
                &name,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(result) = stream.next().await {
                let content = match result {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        String::from_utf8_lossy(&message).trim_end().to_string()
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                };
                let _ = out_tx.send(RunnerMessage::Log {
                    step_execution_id,
                    lines: vec![LogBatchLine { seq, content }],
                });
                seq += 1;
            }
        }))
    } else {
        None
    };

    let mut wait = docker.wait_container(
        &name,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );
    let outcome = match tokio::time::timeout(spec.timeout, wait.next()).await {
        Ok(Some(Ok(response))) => {
            let exit_code = response.status_code as i32;
            JobOutcome {
                state: if exit_code == 0 {
                    StepState::Completed
                } else {
                    StepState::Failed
                },
                exit_code: Some(exit_code),
                message: None,
            }
        }
        Ok(_) => JobOutcome {
            state: StepState::Failed,
            exit_code: None,
            message: Some("container wait failed".into()),
        },
        Err(_) => {
            debug!(step = %spec.step_execution_id, "timeout, stopping container");
            let _ = docker
                .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                .await;
            JobOutcome {
                state: StepState::Timeout,
                exit_code: None,
                message: Some("step timeout".into()),
            }
        }
    };

    if let Some(task) = log_task {
        task.abort();
        let _ = task.await;
    }
    let _ = docker
        .remove_container(
            &name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
    Ok(outcome)
}

/// Native orchestration: the control layer runs as a subprocess against the
/// workspace directory. Used only where containers are unavailable.
async fn run_native(spec: &JobSpec, workspace: &Path) -> anyhow::Result<JobOutcome> {
    let mut child = tokio::process::Command::new("lazyaf-control")
        .env("LAZYAF_WORKSPACE", workspace)
        .env("HOME", workspace.join(HOME_DIR))
        .current_dir(workspace.join(REPO_DIR))
        .spawn()?;

    let outcome = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let exit_code = status.code();
            JobOutcome {
                state: if exit_code == Some(0) {
                    StepState::Completed
                } else {
                    StepState::Failed
                },
                exit_code,
                message: None,
            }
        }
        Ok(Err(e)) => JobOutcome {
            state: StepState::Failed,
            exit_code: None,
            message: Some(e.to_string()),
        },
        Err(_) => {
            let _ = child.kill().await;
            JobOutcome {
                state: StepState::Timeout,
                exit_code: None,
                message: Some("step timeout".into()),
            }
        }
    };
    Ok(outcome)
}

/// Best-effort container teardown on cancel.
pub async fn force_stop(step_execution_id: ResourceId) {
    let Ok(docker) = Docker::connect_with_local_defaults() else {
        return;
    };
    let name = container_name(step_execution_id);
    let _ = docker
        .stop_container(&name, Some(StopContainerOptions { t: 2 }))
        .await;
    let _ = docker
        .remove_container(
            &name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
}

/// Archive a workspace copy and upload it for a cross-runner move.
pub async fn snapshot_workspace(
    base: &Path,
    workspace_id: &str,
    upload_url: &str,
    max_bytes: u64,
) -> anyhow::Result<u64> {
    let dir = base.join(workspace_id);
    if !dir.exists() {
        anyhow::bail!("workspace {workspace_id} not present on this runner");
    }
    let archive = base.join(format!("{workspace_id}.upload.tar.gz"));
    let output = tokio::process::Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(&dir)
        .arg(".")
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "tar failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let bytes = tokio::fs::read(&archive).await?;
    let _ = tokio::fs::remove_file(&archive).await;
    let size = bytes.len() as u64;
    if size > max_bytes {
        anyhow::bail!("workspace archive is {size} bytes, over the {max_bytes} byte limit");
    }
    reqwest::Client::new()
        .post(upload_url)
        .body(bytes)
        .send()
        .await?
        .error_for_status()?;
    info!(workspace = %workspace_id, bytes = size, "workspace snapshot uploaded");
    Ok(size)
}
