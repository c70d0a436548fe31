//! LazyAF runner agent.
//!
//! A stateless client on a target machine: connects to the backend,
//! accepts pushed steps, executes them through its orchestrator, and
//! reports. A runner that cannot reach the backend simply reconnects.

mod agent;
mod orchestrator;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lazyaf_core::ResourceId;
use lazyaf_core::runner::Labels;

#[derive(Debug, Parser)]
#[command(name = "lazyaf-runner", about = "LazyAF remote runner agent")]
struct Args {
    /// Backend WebSocket endpoint.
    #[arg(long, env = "LAZYAF_BACKEND_WS", default_value = "ws://127.0.0.1:3000/ws/runner")]
    backend_ws: String,

    /// Human-readable runner name.
    #[arg(long, env = "LAZYAF_RUNNER_NAME")]
    name: Option<String>,

    /// Orchestrator: "docker" or "native".
    #[arg(long, env = "LAZYAF_RUNNER_TYPE", default_value = "docker")]
    runner_type: String,

    /// Capability labels, `key=value` or bare `key` for booleans.
    #[arg(long = "label", value_name = "KEY[=VALUE]")]
    labels: Vec<String>,

    /// Where this runner keeps its workspace copies.
    #[arg(long, env = "LAZYAF_RUNNER_WORKSPACES", default_value = "./lazyaf-runner-data")]
    workspace_base: PathBuf,

    /// File persisting the runner's identity across restarts.
    #[arg(long, env = "LAZYAF_RUNNER_ID_FILE", default_value = "./lazyaf-runner.id")]
    id_file: PathBuf,
}

fn parse_labels(raw: &[String]) -> Labels {
    let mut labels = Labels::new();
    for entry in raw {
        match entry.split_once('=') {
            Some((key, value)) => labels.insert(key.trim(), value.trim()),
            None => labels.insert(entry.trim(), true),
        }
    }
    labels
}

/// A stable id survives restarts so the backend can link the reconnecting
/// runner back to its row.
async fn load_or_create_id(path: &PathBuf) -> anyhow::Result<ResourceId> {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(id) = content.trim().parse() {
            return Ok(id);
        }
    }
    let id = ResourceId::new();
    tokio::fs::write(path, id.to_string()).await?;
    Ok(id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.runner_type != "docker" && args.runner_type != "native" {
        anyhow::bail!("unknown runner type: {}", args.runner_type);
    }
    tokio::fs::create_dir_all(&args.workspace_base).await?;

    let runner_id = load_or_create_id(&args.id_file).await?;
    let config = agent::AgentConfig {
        backend_ws: args.backend_ws,
        runner_id,
        name: args.name,
        runner_type: args.runner_type,
        labels: parse_labels(&args.labels),
        workspace_base: args.workspace_base,
    };
    info!(runner = %runner_id, runner_type = %config.runner_type, "runner starting");

    // Never decide to drop work on our own: reconnect forever.
    let mut backoff = Duration::from_secs(1);
    loop {
        match agent::connect_and_serve(&config).await {
            Ok(()) => {
                info!("backend closed the session, reconnecting");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                warn!(error = %e, "connection lost, reconnecting in {backoff:?}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyaf_core::runner::LabelValue;

    #[test]
    fn labels_parse_pairs_and_booleans() {
        let labels = parse_labels(&[
            "arch=arm64".to_string(),
            "gpio".to_string(),
            "has = cuda ".to_string(),
        ]);
        assert_eq!(labels.get("arch"), Some(&LabelValue::Str("arm64".into())));
        assert_eq!(labels.get("gpio"), Some(&LabelValue::Bool(true)));
        assert_eq!(labels.get("has"), Some(&LabelValue::Str("cuda".into())));
    }
}
