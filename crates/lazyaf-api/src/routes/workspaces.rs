//! Workspace snapshot transfer endpoints, used for cross-runner affinity
//! moves. Archives are tar.gz, bounded by the configured transfer limit.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::get;
use tokio::process::Command;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/snapshot", get(download_snapshot).post(upload_snapshot))
}

fn archive_path(state: &AppState, id: &str) -> std::path::PathBuf {
    state.settings.snapshots_dir().join(format!("{id}.tar.gz"))
}

/// A runner uploads the archived workspace it holds.
async fn upload_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if body.len() as u64 > state.settings.workspace_transfer_max_bytes {
        return Err(ApiError::BadRequest(format!(
            "snapshot exceeds transfer limit of {} bytes",
            state.settings.workspace_transfer_max_bytes
        )));
    }
    let path = archive_path(&state, &id);
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(workspace = %id, bytes = body.len(), "workspace snapshot stored");
    Ok(StatusCode::CREATED)
}

/// The next runner downloads the workspace. An uploaded archive wins;
/// otherwise the backend archives its own local copy on demand.
async fn download_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let path = archive_path(&state, &id);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let workspace_dir = state.settings.workspace_dir(&id);
        if !workspace_dir.exists() {
            return Err(ApiError::NotFound(format!("workspace {id} has no snapshot")));
        }
        let output = Command::new("tar")
            .arg("-czf")
            .arg(&path)
            .arg("-C")
            .arg(&workspace_dir)
            .arg(".")
            .output()
            .await
            .map_err(|e| ApiError::Internal(format!("tar spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(ApiError::Internal(format!(
                "tar failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if bytes.len() as u64 > state.settings.workspace_transfer_max_bytes {
        return Err(ApiError::Internal(format!(
            "workspace {id} exceeds the transfer limit"
        )));
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/gzip".to_string())],
        bytes,
    )
        .into_response())
}
