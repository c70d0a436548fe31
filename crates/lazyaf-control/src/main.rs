//! LazyAF control layer.
//!
//! Runs as the entrypoint of script and agent step containers (and as a
//! subprocess under native orchestration): reads the step config, launches
//! the payload, and streams status, logs, and heartbeats back to the
//! backend. Reporting never blocks the payload; a 404 from the backend
//! means the step is already terminal, so we log locally and exit cleanly.

mod report;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lazyaf_core::control::StepControlConfig;
use lazyaf_core::step::StepConfig;
use lazyaf_core::workspace::{CONTROL_DIR, REPO_DIR, STEP_CONFIG_FILE};

use report::Reporter;

const LOG_BATCH_MAX: usize = 50;
const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

fn workspace_root() -> PathBuf {
    std::env::var("LAZYAF_WORKSPACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/workspace"))
}

/// Build the payload command for the step kind.
fn payload_command(config: &StepConfig, workspace: &PathBuf) -> anyhow::Result<tokio::process::Command> {
    let repo_dir = workspace.join(REPO_DIR);
    match config {
        StepConfig::Script {
            command,
            working_dir,
        } => {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            match working_dir {
                Some(dir) => cmd.current_dir(repo_dir.join(dir)),
                None => cmd.current_dir(&repo_dir),
            };
            Ok(cmd)
        }
        StepConfig::Agent {
            title,
            description,
            runner_type,
            model,
            ..
        } => {
            let binary = match runner_type.as_str() {
                "gemini" => "gemini",
                _ => "claude",
            };
            let mut cmd = tokio::process::Command::new(binary);
            cmd.arg("-p").arg(format!("{title}\n\n{description}"));
            if let Some(model) = model {
                cmd.arg("--model").arg(model);
            }
            cmd.current_dir(&repo_dir);
            Ok(cmd)
        }
        StepConfig::Docker { .. } => {
            // Docker steps run their own entrypoint; the control layer has
            // no payload to wrap.
            anyhow::bail!("docker steps do not use the control layer")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workspace = workspace_root();
    let config_path = workspace.join(CONTROL_DIR).join(STEP_CONFIG_FILE);
    let raw = tokio::fs::read_to_string(&config_path).await?;
    let config: StepControlConfig = serde_json::from_str(&raw)?;
    info!(step = %config.step_execution_id, "control layer starting");

    let reporter = Reporter::new(&config);
    if reporter.post_status("running", None, None).await.is_terminal() {
        info!("step already terminal, exiting cleanly");
        return Ok(());
    }

    let mut cmd = payload_command(&config.step, &workspace)?;
    cmd.env("HOME", workspace.join("home"));
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    // Merge stdout and stderr into one sequenced stream.
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("{line}");
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{line}");
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let log_task = tokio::spawn(pump_logs(reporter.clone(), line_rx));

    let heartbeat_reporter = reporter.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_seconds.max(1));
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if heartbeat_reporter.post_heartbeat().await.is_terminal() {
                break;
            }
        }
    });

    // Best-effort timeout; the host-side executor is authoritative.
    let timeout = Duration::from_secs(config.timeout_seconds);
    let exit = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("payload exceeded timeout, killing");
            let _ = child.kill().await;
            heartbeat_task.abort();
            let _ = log_task.await;
            reporter
                .post_status("failed", None, Some("payload timeout"))
                .await;
            std::process::exit(1);
        }
    };

    heartbeat_task.abort();
    // Drain remaining log lines before the terminal report.
    let _ = log_task.await;

    let exit_code = exit.code().unwrap_or(-1);
    let status = if exit.success() { "completed" } else { "failed" };
    let outcome = reporter.post_status(status, Some(exit_code), None).await;
    if outcome.is_terminal() {
        info!("backend already closed this step");
    }
    info!(%status, exit_code, "payload finished");
    std::process::exit(if exit.success() { 0 } else { exit_code.max(1) });
}

/// Batch log lines and ship them with monotonic sequence numbers.
async fn pump_logs(reporter: Reporter, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut seq: i64 = 0;
    let mut batch: Vec<(i64, String)> = Vec::new();
    let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Some(content) => {
                        batch.push((seq, content));
                        seq += 1;
                        if batch.len() >= LOG_BATCH_MAX {
                            reporter.post_logs(std::mem::take(&mut batch)).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            reporter.post_logs(std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    reporter.post_logs(std::mem::take(&mut batch)).await;
                }
            }
        }
    }
}
