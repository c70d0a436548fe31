//! Pipeline run endpoints: listing, detail, cancel, and step executions.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use lazyaf_core::ResourceId;
use lazyaf_db::{PipelineRunRecord, StepExecutionRecord};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/retry", post(retry_run))
        .route("/{id}/steps", get(list_steps))
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub pipeline_id: Option<String>,
    pub pipeline_name: String,
    pub status: String,
    pub current_step_id: Option<String>,
    pub steps_completed: i32,
    pub steps_total: i32,
    pub trigger_type: String,
    pub branch: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<PipelineRunRecord> for RunResponse {
    fn from(record: PipelineRunRecord) -> Self {
        Self {
            id: record.id.to_string(),
            pipeline_id: record.pipeline_id.map(|p| p.to_string()),
            pipeline_name: record.pipeline_name,
            status: record.status,
            current_step_id: record.current_step_id,
            steps_completed: record.steps_completed,
            steps_total: record.steps_total,
            trigger_type: record.trigger_type,
            branch: record.branch,
            failure_reason: record.failure_reason,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let runs = state.runs.list_recent(100).await?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let record = state.runs.get(ResourceId::from(id)).await?;
    Ok(Json(record.into()))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .executor
        .cancel(ResourceId::from(id), "cancelled via API")
        .await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

/// Debug-rerun: a fresh run with the same graph snapshot and trigger
/// context. Only terminal runs may be retried.
async fn retry_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let old = state.runs.get(ResourceId::from(id)).await?;
    if !old.state()?.is_terminal() {
        return Err(ApiError::Conflict("run is still in progress".into()));
    }
    let new_id = ResourceId::new();
    let graph = old.graph()?;
    let context = old.context()?;
    let record = state
        .runs
        .create(lazyaf_db::runs::NewRun {
            id: new_id,
            pipeline_id: old.pipeline_id.map(ResourceId::from),
            repo_id: ResourceId::from(old.repo_id),
            pipeline_name: &old.pipeline_name,
            graph: &graph,
            trigger_type: "manual",
            trigger_context: &context,
            trigger_key: &format!("manual:retry-{id}:{new_id}"),
            branch: old.branch.as_deref(),
        })
        .await?;
    let _ = state
        .actions
        .send(lazyaf_engine::EngineAction::SpawnRun(new_id));
    Ok(Json(record.into()))
}

#[derive(Debug, Serialize)]
struct StepExecutionResponse {
    id: String,
    step_id: String,
    execution_key: String,
    attempt: i32,
    status: String,
    runner_id: Option<String>,
    exit_code: Option<i32>,
    failure_reason: Option<String>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<StepExecutionRecord> for StepExecutionResponse {
    fn from(record: StepExecutionRecord) -> Self {
        Self {
            id: record.id.to_string(),
            step_id: record.step_id,
            execution_key: record.execution_key,
            attempt: record.attempt,
            status: record.status,
            runner_id: record.runner_id.map(|r| r.to_string()),
            exit_code: record.exit_code,
            failure_reason: record.failure_reason,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StepExecutionResponse>>, ApiError> {
    let executions = state.steps.for_run(ResourceId::from(id)).await?;
    Ok(Json(executions.into_iter().map(Into::into).collect()))
}
