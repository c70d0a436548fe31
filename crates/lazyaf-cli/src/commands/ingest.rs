//! `lazyaf ingest PATH` — register a repo on the backend and push the local
//! history into the internal git server.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::post_json;

#[derive(Debug, Deserialize)]
struct RepoResponse {
    id: String,
    name: String,
    clone_url: String,
}

async fn git(path: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub async fn run(
    base_url: &str,
    path: &Path,
    name: Option<String>,
    branch: Option<String>,
    all_branches: bool,
) -> anyhow::Result<()> {
    if !path.join(".git").exists() {
        anyhow::bail!("{} is not a git repository", path.display());
    }

    let name = match name {
        Some(name) => name,
        None => path
            .canonicalize()?
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("cannot derive a repo name from the path"))?,
    };
    let branch = match branch {
        Some(branch) => branch,
        None => git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string(),
    };

    let repo: RepoResponse = post_json(
        &format!("{base_url}/api/repos"),
        &serde_json::json!({
            "name": name,
            "default_branch": branch,
        }),
    )
    .await?;

    if all_branches {
        git(path, &["push", "--all", &repo.clone_url]).await?;
    } else {
        git(
            path,
            &["push", &repo.clone_url, &format!("{branch}:{branch}")],
        )
        .await?;
    }

    let _: RepoResponse = post_json(
        &format!("{base_url}/api/repos/{}/ingested", repo.id),
        &serde_json::json!({}),
    )
    .await?;

    println!("ingested {} as {} ({})", path.display(), repo.name, repo.id);
    println!("clone url: {}", repo.clone_url);
    Ok(())
}
