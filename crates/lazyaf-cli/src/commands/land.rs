//! `lazyaf land REPO_ID --branch X` — merge a working branch into the
//! repo's default branch on the internal git server.

use lazyaf_core::ResourceId;
use serde::Deserialize;

use super::{get_json, post_json};

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
    default_branch: String,
    remote_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LandResponse {
    merged: String,
    into: String,
}

pub async fn run(base_url: &str, repo_id: ResourceId, branch: &str, pr: bool) -> anyhow::Result<()> {
    let repo: RepoResponse = get_json(&format!("{base_url}/api/repos/{repo_id}")).await?;

    if pr {
        let Some(remote) = repo.remote_url else {
            anyhow::bail!("repo {} has no external remote configured for PRs", repo.name);
        };
        let compare = format!(
            "{}/compare/{}...{}",
            remote.trim_end_matches(".git"),
            repo.default_branch,
            branch
        );
        println!("open a pull request: {compare}");
        return Ok(());
    }

    let landed: LandResponse = post_json(
        &format!("{base_url}/api/repos/{repo_id}/land"),
        &serde_json::json!({ "branch": branch }),
    )
    .await?;
    println!("merged {} into {} on {}", landed.merged, landed.into, repo.name);
    Ok(())
}
