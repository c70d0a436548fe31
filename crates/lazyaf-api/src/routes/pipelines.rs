//! Pipeline definition endpoints and the manual run trigger.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lazyaf_core::ResourceId;
use lazyaf_core::pipeline::StepsGraph;
use lazyaf_core::trigger::TriggerSpec;
use lazyaf_db::PipelineRecord;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines).post(create_pipeline))
        .route("/{id}", get(get_pipeline).put(update_pipeline).delete(delete_pipeline))
        .route("/{id}/run", post(trigger_run))
        .route("/{id}/runs", get(list_runs))
}

#[derive(Debug, Serialize)]
struct PipelineResponse {
    id: String,
    repo_id: String,
    name: String,
    steps_graph: serde_json::Value,
    triggers: serde_json::Value,
}

impl From<PipelineRecord> for PipelineResponse {
    fn from(record: PipelineRecord) -> Self {
        Self {
            id: record.id.to_string(),
            repo_id: record.repo_id.to_string(),
            name: record.name,
            steps_graph: record.steps_graph,
            triggers: record.triggers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListPipelinesQuery {
    repo_id: Uuid,
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<Vec<PipelineResponse>>, ApiError> {
    let pipelines = state
        .pipelines
        .list_by_repo(ResourceId::from(query.repo_id))
        .await?;
    Ok(Json(pipelines.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
struct CreatePipelineRequest {
    repo_id: Uuid,
    name: String,
    steps_graph: StepsGraph,
    #[serde(default)]
    triggers: Vec<TriggerSpec>,
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let repo_id = ResourceId::from(req.repo_id);
    state.repos.get(repo_id).await?;
    req.steps_graph.validate()?;
    if state
        .pipelines
        .get_by_name(repo_id, &req.name)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!(
            "pipeline {} already exists",
            req.name
        )));
    }
    let record = state
        .pipelines
        .create(repo_id, &req.name, &req.steps_graph, &req.triggers)
        .await?;
    Ok(Json(record.into()))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let record = state.pipelines.get(ResourceId::from(id)).await?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize)]
struct UpdatePipelineRequest {
    steps_graph: StepsGraph,
    #[serde(default)]
    triggers: Vec<TriggerSpec>,
}

async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePipelineRequest>,
) -> Result<Json<PipelineResponse>, ApiError> {
    req.steps_graph.validate()?;
    let record = state
        .pipelines
        .update(ResourceId::from(id), &req.steps_graph, &req.triggers)
        .await?;
    Ok(Json(record.into()))
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from(id);
    state.pipelines.get(id).await?;
    state.pipelines.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct TriggerRunRequest {
    branch: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    pipeline_run_id: String,
}

async fn trigger_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TriggerRunRequest>,
) -> Result<Json<TriggerRunResponse>, ApiError> {
    let run_id = state
        .triggers
        .manual(ResourceId::from(id), req.branch.as_deref())
        .await?;
    Ok(Json(TriggerRunResponse {
        pipeline_run_id: run_id.to_string(),
    }))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<super::runs::RunResponse>>, ApiError> {
    let runs = state
        .runs
        .list_for_pipeline(ResourceId::from(id), 50)
        .await?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}
