//! Runner listing.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_runners))
}

#[derive(Debug, Serialize)]
struct RunnerResponse {
    id: String,
    name: Option<String>,
    runner_type: String,
    labels: serde_json::Value,
    status: String,
    current_step_execution_id: Option<String>,
    connected_at: Option<chrono::DateTime<chrono::Utc>>,
    last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

async fn list_runners(
    State(state): State<AppState>,
) -> Result<Json<Vec<RunnerResponse>>, ApiError> {
    let runners = state.runners.list().await?;
    Ok(Json(
        runners
            .into_iter()
            .map(|r| RunnerResponse {
                id: r.id.to_string(),
                name: r.name,
                runner_type: r.runner_type,
                labels: r.labels,
                status: r.status,
                current_step_execution_id: r.current_step_execution_id.map(|s| s.to_string()),
                connected_at: r.connected_at,
                last_heartbeat: r.last_heartbeat,
            })
            .collect(),
    ))
}
