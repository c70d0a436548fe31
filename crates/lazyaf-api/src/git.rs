//! Internal git smart-HTTP server.
//!
//! One bare repository per repo id under `git_repos/{repo_id}.git/`, served
//! through the stateless-RPC services. A successful receive-pack emits one
//! push event per updated ref.

use std::io::Read;
use std::process::Stdio;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use lazyaf_core::ResourceId;

use crate::error::ApiError;
use crate::pktline;
use crate::state::AppState;

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";

#[derive(Debug, Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

/// Strip the `.git` suffix from the path segment and resolve the repo.
fn parse_repo_segment(segment: &str) -> Result<ResourceId, ApiError> {
    let name = segment
        .strip_suffix(".git")
        .ok_or_else(|| ApiError::NotFound(format!("not a repository path: {segment}")))?;
    name.parse()
        .map_err(|_| ApiError::NotFound(format!("bad repository id: {name}")))
}

/// Request bodies may arrive gzip-compressed.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, ApiError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    if !gzipped {
        return Ok(body.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut decoded)
        .map_err(|e| ApiError::BadRequest(format!("bad gzip body: {e}")))?;
    Ok(decoded)
}

/// `GET /git/{repo_id}.git/info/refs?service=...` — ref advertisement.
pub async fn info_refs(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, ApiError> {
    let repo_id = parse_repo_segment(&segment)?;
    let service = query
        .service
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("dumb HTTP protocol is not supported".into()))?;
    if service != UPLOAD_PACK && service != RECEIVE_PACK {
        return Err(ApiError::BadRequest(format!("unknown service: {service}")));
    }
    let dir = repo_dir(&state, repo_id).await?;

    let output = Command::new("git")
        .arg(service.trim_start_matches("git-"))
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(&dir)
        .output()
        .await
        .map_err(|e| ApiError::Internal(format!("git spawn failed: {e}")))?;
    if !output.status.success() {
        return Err(ApiError::Internal(format!(
            "{service} advertisement failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut body = Vec::new();
    body.extend_from_slice(pktline::encode(&format!("# service={service}\n")).as_bytes());
    body.extend_from_slice(pktline::FLUSH.as_bytes());
    body.extend_from_slice(&output.stdout);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{service}-advertisement"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}

/// `POST /git/{repo_id}.git/git-upload-pack` — clone/fetch payload.
pub async fn upload_pack(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let repo_id = parse_repo_segment(&segment)?;
    let dir = repo_dir(&state, repo_id).await?;
    let input = decode_body(&headers, body)?;
    let stdout = run_service(UPLOAD_PACK, &dir, &input).await?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            format!("application/x-{UPLOAD_PACK}-result"),
        )],
        stdout,
    )
        .into_response())
}

/// `POST /git/{repo_id}.git/git-receive-pack` — push payload. Updated refs
/// feed the trigger service.
pub async fn receive_pack(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let repo_id = parse_repo_segment(&segment)?;
    let dir = repo_dir(&state, repo_id).await?;
    let input = decode_body(&headers, body)?;
    let updates = pktline::parse_ref_updates(&input);
    let stdout = run_service(RECEIVE_PACK, &dir, &input).await?;

    if !updates.is_empty() {
        info!(repo = %repo_id, refs = updates.len(), "push received");
        let triggers = state.triggers.clone();
        tokio::spawn(async move {
            for update in updates {
                if let Err(e) = triggers
                    .on_push(repo_id, &update.git_ref, &update.old_sha, &update.new_sha)
                    .await
                {
                    warn!(repo = %repo_id, git_ref = %update.git_ref, error = %e, "push trigger failed");
                }
            }
        });
    }

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            format!("application/x-{RECEIVE_PACK}-result"),
        )],
        stdout,
    )
        .into_response())
}

/// `GET /git/{repo_id}.git/HEAD`.
pub async fn head(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> Result<Response, ApiError> {
    let repo_id = parse_repo_segment(&segment)?;
    let dir = repo_dir(&state, repo_id).await?;
    let content = tokio::fs::read_to_string(std::path::Path::new(&dir).join("HEAD"))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain".to_string())],
        content,
    )
        .into_response())
}

async fn repo_dir(state: &AppState, repo_id: ResourceId) -> Result<String, ApiError> {
    // The row is the source of truth; the directory must exist too.
    state.repos.get(repo_id).await?;
    if !state.git.bare_exists(repo_id).await {
        return Err(ApiError::NotFound(format!("repository {repo_id} has no storage")));
    }
    Ok(state.git.bare_dir(repo_id).to_string_lossy().to_string())
}

/// Run a stateless-RPC service, piping the request body through stdin.
async fn run_service(service: &str, dir: &str, input: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut child = Command::new("git")
        .arg(service.trim_start_matches("git-"))
        .arg("--stateless-rpc")
        .arg(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ApiError::Internal(format!("git spawn failed: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .map_err(|e| ApiError::Internal(format!("git stdin failed: {e}")))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ApiError::Internal(format!("git wait failed: {e}")))?;
    if !output.status.success() {
        return Err(ApiError::Internal(format!(
            "{service} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}
