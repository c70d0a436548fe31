//! Card endpoints: CRUD, standalone start, and the status transition that
//! feeds card-complete triggers.

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lazyaf_core::ResourceId;
use lazyaf_core::card::CardStatus;
use lazyaf_core::events::UiEvent;
use lazyaf_core::step::StepConfig;
use lazyaf_db::CardRecord;
use lazyaf_engine::EngineAction;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_cards).post(create_card))
        .route("/{id}", get(get_card).delete(delete_card))
        .route("/{id}/status", patch(set_status))
        .route("/{id}/start", post(start_card))
}

#[derive(Debug, Serialize)]
struct CardResponse {
    id: String,
    repo_id: String,
    title: String,
    description: String,
    status: String,
    branch_name: Option<String>,
    step_type: String,
    step_config: serde_json::Value,
    job_id: Option<String>,
}

impl From<CardRecord> for CardResponse {
    fn from(record: CardRecord) -> Self {
        Self {
            id: record.id.to_string(),
            repo_id: record.repo_id.to_string(),
            title: record.title,
            description: record.description,
            status: record.status,
            branch_name: record.branch_name,
            step_type: record.step_type,
            step_config: record.step_config,
            job_id: record.job_id.map(|j| j.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListCardsQuery {
    repo_id: Uuid,
}

async fn list_cards(
    State(state): State<AppState>,
    Query(query): Query<ListCardsQuery>,
) -> Result<Json<Vec<CardResponse>>, ApiError> {
    let cards = state
        .cards
        .list_by_repo(ResourceId::from(query.repo_id))
        .await?;
    Ok(Json(cards.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
struct CreateCardRequest {
    repo_id: Uuid,
    title: String,
    #[serde(default)]
    description: String,
    step_config: StepConfig,
}

async fn create_card(
    State(state): State<AppState>,
    Json(req): Json<CreateCardRequest>,
) -> Result<Json<CardResponse>, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("card title must not be empty".into()));
    }
    let repo_id = ResourceId::from(req.repo_id);
    state.repos.get(repo_id).await?;
    let record = state
        .cards
        .create(
            repo_id,
            &req.title,
            &req.description,
            req.step_config.kind(),
            &req.step_config,
        )
        .await?;
    Ok(Json(record.into()))
}

async fn get_card(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CardResponse>, ApiError> {
    let record = state.cards.get(ResourceId::from(id)).await?;
    Ok(Json(record.into()))
}

async fn delete_card(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from(id);
    state.cards.get(id).await?;
    state.cards.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: String,
}

/// Status transitions from the UI. Moving a card into review fires the
/// card-complete trigger path.
async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<CardResponse>, ApiError> {
    let id = ResourceId::from(id);
    let status = CardStatus::parse(&req.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown card status: {}", req.status)))?;
    state.cards.get(id).await?;
    state.cards.set_status(id, status).await?;
    state.broadcaster.send(UiEvent::CardUpdated {
        card_id: id,
        status: status.to_string(),
    });
    if status == CardStatus::InReview {
        let _ = state.actions.send(EngineAction::CardComplete {
            card_id: id,
            status,
        });
    }
    let record = state.cards.get(id).await?;
    Ok(Json(record.into()))
}

#[derive(Debug, Serialize)]
struct StartCardResponse {
    job_id: String,
    pipeline_run_id: Option<String>,
    status: String,
}

async fn start_card(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StartCardResponse>, ApiError> {
    let job = state.jobs.start_card(ResourceId::from(id)).await?;
    Ok(Json(StartCardResponse {
        job_id: job.id.to_string(),
        pipeline_run_id: job.pipeline_run_id.map(|r| r.to_string()),
        status: job.status,
    }))
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    id: String,
    card_id: String,
    pipeline_run_id: Option<String>,
    status: String,
    test_pass_count: i32,
    test_fail_count: i32,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.jobs_store.get(ResourceId::from(id)).await?;
    Ok(Json(JobResponse {
        id: job.id.to_string(),
        card_id: job.card_id.to_string(),
        pipeline_run_id: job.pipeline_run_id.map(|r| r.to_string()),
        status: job.status,
        test_pass_count: job.test_pass_count,
        test_fail_count: job.test_fail_count,
    }))
}
