//! LazyAF CLI.
//!
//! Exit codes: 0 success, 1 generic failure, 2 usage error (clap's
//! default).

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lazyaf_core::ResourceId;

#[derive(Debug, Parser)]
#[command(name = "lazyaf", about = "LazyAF local-first CI", version)]
struct Cli {
    /// Backend base URL.
    #[arg(long, env = "LAZYAF_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Push a local repository into the internal git server.
    Ingest {
        /// Path to the local repository.
        path: PathBuf,
        /// Name for the repo on the platform (defaults to the directory name).
        #[arg(long)]
        name: Option<String>,
        /// Branch to ingest (defaults to the current branch).
        #[arg(long)]
        branch: Option<String>,
        /// Push every branch instead of one.
        #[arg(long)]
        all_branches: bool,
    },
    /// Merge a working branch into the repo's default branch.
    Land {
        /// Repo id.
        repo_id: ResourceId,
        /// Branch to land.
        #[arg(long)]
        branch: String,
        /// Print a pull-request URL for the external remote instead of
        /// merging internally.
        #[arg(long)]
        pr: bool,
    },
    /// Inspect a step execution session.
    Debug {
        /// Step execution id.
        session_id: ResourceId,
        /// Open a shell in a sidecar container sharing the step's workspace.
        #[arg(long, conflicts_with = "shell")]
        sidecar: bool,
        /// Open a shell inside the step container itself.
        #[arg(long)]
        shell: bool,
        /// Retry the owning pipeline run.
        #[arg(long, conflicts_with = "abort")]
        resume: bool,
        /// Cancel the owning pipeline run.
        #[arg(long)]
        abort: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Ingest {
            path,
            name,
            branch,
            all_branches,
        } => commands::ingest::run(&cli.url, &path, name, branch, all_branches).await,
        Commands::Land {
            repo_id,
            branch,
            pr,
        } => commands::land::run(&cli.url, repo_id, &branch, pr).await,
        Commands::Debug {
            session_id,
            sidecar,
            shell,
            resume,
            abort,
        } => commands::debug::run(&cli.url, session_id, sidecar, shell, resume, abort).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
