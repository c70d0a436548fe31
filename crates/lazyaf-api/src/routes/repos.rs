//! Repo management endpoints: CRUD, ingest bookkeeping, and landing a
//! branch onto the default branch.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lazyaf_core::ResourceId;
use lazyaf_db::RepoRecord;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_repos).post(create_repo))
        .route("/{id}", get(get_repo).delete(delete_repo))
        .route("/{id}/ingested", post(mark_ingested))
        .route("/{id}/land", post(land_branch))
}

#[derive(Debug, Serialize)]
struct RepoResponse {
    id: String,
    name: String,
    default_branch: String,
    remote_url: Option<String>,
    is_ingested: bool,
    clone_url: String,
}

fn to_response(state: &AppState, record: RepoRecord) -> RepoResponse {
    let clone_url = state.settings.repo_clone_url(ResourceId::from(record.id));
    RepoResponse {
        id: record.id.to_string(),
        name: record.name,
        default_branch: record.default_branch,
        remote_url: record.remote_url,
        is_ingested: record.is_ingested,
        clone_url,
    }
}

async fn list_repos(State(state): State<AppState>) -> Result<Json<Vec<RepoResponse>>, ApiError> {
    let repos = state.repos.list().await?;
    Ok(Json(
        repos.into_iter().map(|r| to_response(&state, r)).collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct CreateRepoRequest {
    name: String,
    #[serde(default = "default_branch")]
    default_branch: String,
    remote_url: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

async fn create_repo(
    State(state): State<AppState>,
    Json(req): Json<CreateRepoRequest>,
) -> Result<Json<RepoResponse>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("repo name must not be empty".into()));
    }
    if state.repos.get_by_name(&req.name).await?.is_some() {
        return Err(ApiError::Conflict(format!("repo {} already exists", req.name)));
    }
    let record = state
        .repos
        .create(&req.name, &req.default_branch, req.remote_url.as_deref())
        .await?;
    state
        .git
        .init_bare(ResourceId::from(record.id), &record.default_branch)
        .await?;
    Ok(Json(to_response(&state, record)))
}

async fn get_repo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepoResponse>, ApiError> {
    let record = state.repos.get(ResourceId::from(id)).await?;
    Ok(Json(to_response(&state, record)))
}

async fn mark_ingested(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepoResponse>, ApiError> {
    let id = ResourceId::from(id);
    state.repos.mark_ingested(id).await?;
    let record = state.repos.get(id).await?;
    Ok(Json(to_response(&state, record)))
}

async fn delete_repo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from(id);
    state.repos.get(id).await?;
    state.repos.delete(id).await?;
    let dir = state.git.bare_dir(id);
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if dir.exists() {
            tracing::warn!(repo = %id, error = %e, "bare repo removal failed");
        }
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct LandRequest {
    branch: String,
}

/// Merge a working branch into the repo's default branch. Conflicts fail
/// loudly with git's stderr.
async fn land_branch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<LandRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from(id);
    let repo = state.repos.get(id).await?;
    state
        .git
        .merge_branch(id, &req.branch, &repo.default_branch)
        .await?;
    Ok(Json(serde_json::json!({
        "merged": req.branch,
        "into": repo.default_branch,
    })))
}
