//! `lazyaf debug SESSION_ID` — inspect a step execution: print its state
//! and log tail, open a shell, or resume/abort the owning run.

use std::process::Command;

use lazyaf_core::ResourceId;
use serde::Deserialize;

use super::{get_json, post_json};

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StepExecutionResponse {
    id: String,
    step_id: String,
    status: String,
    exit_code: Option<i32>,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogLineResponse {
    content: String,
}

const LOG_TAIL: usize = 40;

pub async fn run(
    base_url: &str,
    session_id: ResourceId,
    sidecar: bool,
    shell: bool,
    resume: bool,
    abort: bool,
) -> anyhow::Result<()> {
    // The session id is a step execution id; its run comes from the key.
    let logs: Vec<LogLineResponse> =
        get_json(&format!("{base_url}/api/steps/{session_id}/logs")).await?;

    // Find the owning run through the recent-runs listing.
    let runs: Vec<RunResponse> = get_json(&format!("{base_url}/api/runs")).await?;
    let mut owner: Option<(RunResponse, StepExecutionResponse)> = None;
    for run in runs {
        let steps: Vec<StepExecutionResponse> =
            get_json(&format!("{base_url}/api/runs/{}/steps", run.id)).await?;
        if let Some(step) = steps.into_iter().find(|s| s.id == session_id.to_string()) {
            owner = Some((run, step));
            break;
        }
    }
    let Some((run, step)) = owner else {
        anyhow::bail!("no pipeline run owns step execution {session_id}");
    };

    println!("step {} ({})", step.step_id, step.id);
    println!("  status: {}", step.status);
    if let Some(code) = step.exit_code {
        println!("  exit code: {code}");
    }
    if let Some(reason) = &step.failure_reason {
        println!("  reason: {reason}");
    }
    println!("  run {} ({})", run.id, run.status);
    if !logs.is_empty() {
        println!("--- last {} log lines ---", LOG_TAIL.min(logs.len()));
        for line in logs.iter().rev().take(LOG_TAIL).rev() {
            println!("{}", line.content);
        }
    }

    if abort {
        let _: serde_json::Value = post_json(
            &format!("{base_url}/api/runs/{}/cancel", run.id),
            &serde_json::json!({}),
        )
        .await?;
        println!("run {} cancelled", run.id);
        return Ok(());
    }
    if resume {
        let retried: RunResponse = post_json(
            &format!("{base_url}/api/runs/{}/retry", run.id),
            &serde_json::json!({}),
        )
        .await?;
        println!("retry spawned as run {}", retried.id);
        return Ok(());
    }

    let container = format!("lazyaf-step-{session_id}");
    if shell {
        // Hand the terminal over to docker exec.
        let status = Command::new("docker")
            .args(["exec", "-it", &container, "sh"])
            .status()?;
        if !status.success() {
            anyhow::bail!("docker exec failed (is the step container still running?)");
        }
    } else if sidecar {
        let status = Command::new("docker")
            .args([
                "run",
                "--rm",
                "-it",
                "--volumes-from",
                &container,
                "alpine:latest",
                "sh",
            ])
            .status()?;
        if !status.success() {
            anyhow::bail!("sidecar launch failed (is the step container still present?)");
        }
    }
    Ok(())
}
