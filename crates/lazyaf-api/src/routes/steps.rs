//! Step control endpoints: the in-container control layer reports status,
//! logs, and heartbeats here. Every call carries the single-use step token.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use lazyaf_core::ResourceId;
use lazyaf_core::control::{LogReport, StatusReport};
use lazyaf_core::events::UiEvent;
use lazyaf_core::runner::RunnerState;
use lazyaf_core::step::StepState;
use lazyaf_db::StepExecutionRecord;
use lazyaf_executor::RemoteOutcome;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/status", post(post_status))
        .route("/{id}/logs", post(post_logs).get(get_logs))
        .route("/{id}/heartbeat", post(post_heartbeat))
}

/// Bearer-token check against the digest stored on the execution row.
fn authorize(headers: &HeaderMap, record: &StepExecutionRecord) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing step token".into()))?;
    let digest = record
        .step_token_digest
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("no token issued for this step".into()))?;
    let presented = hex::encode(Sha256::digest(token.as_bytes()));
    if presented != digest {
        return Err(ApiError::Unauthorized("bad step token".into()));
    }
    Ok(())
}

async fn load(state: &AppState, id: Uuid) -> Result<StepExecutionRecord, ApiError> {
    Ok(state.steps.get(ResourceId::from(id)).await?)
}

/// `POST /api/steps/{id}/status`. A 404 on an already-terminal step tells
/// the control layer to log locally and exit cleanly.
async fn post_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ApiError> {
    let record = load(&state, id).await?;
    authorize(&headers, &record)?;
    let step_execution_id = ResourceId::from(record.id);

    if record.state()?.is_terminal() {
        return Err(ApiError::Gone("step already terminal".into()));
    }

    let state_reported = StepState::parse(&report.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", report.status)))?;

    let moved = match state_reported {
        StepState::Running => {
            state
                .steps
                .transition(
                    step_execution_id,
                    &[StepState::Assigned, StepState::Preparing],
                    StepState::Running,
                    None,
                    None,
                )
                .await?
        }
        s if s.is_terminal() => {
            let moved = state
                .steps
                .transition(
                    step_execution_id,
                    &[StepState::Assigned, StepState::Preparing, StepState::Running],
                    s,
                    report.exit_code,
                    report.message.as_deref(),
                )
                .await?;
            if moved {
                // Settle the remote bookkeeping too: the runner that hosted
                // this container goes idle and any waiter is released.
                if let Some(runner_id) = record.runner_id {
                    let runner_id = ResourceId::from(runner_id);
                    let _ = state
                        .runners
                        .transition(
                            runner_id,
                            &[RunnerState::Assigned, RunnerState::Busy],
                            RunnerState::Idle,
                        )
                        .await;
                }
                state
                    .registry
                    .resolve_completion(
                        step_execution_id,
                        RemoteOutcome::Terminal {
                            state: s,
                            exit_code: report.exit_code,
                        },
                    )
                    .await;
            }
            moved
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "control layer may not report {other}"
            )));
        }
    };

    if moved {
        state.broadcaster.send(UiEvent::StepStatus {
            pipeline_run_id: ResourceId::from(record.pipeline_run_id),
            step_execution_id,
            step_id: record.step_id,
            status: state_reported.to_string(),
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/steps/{id}/logs` — batched lines with sequence numbers.
async fn post_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(report): Json<LogReport>,
) -> Result<StatusCode, ApiError> {
    let record = load(&state, id).await?;
    authorize(&headers, &record)?;
    let step_execution_id = ResourceId::from(record.id);

    let pairs: Vec<(i64, String)> = report
        .lines
        .iter()
        .map(|l| (l.seq, l.content.clone()))
        .collect();
    state.logs.append(step_execution_id, &pairs).await?;
    state.broadcaster.send(UiEvent::StepLogs {
        step_execution_id,
        lines: report.lines.into_iter().map(|l| l.content).collect(),
    });
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/steps/{id}/heartbeat`.
async fn post_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let record = load(&state, id).await?;
    authorize(&headers, &record)?;
    if record.state()?.is_terminal() {
        return Err(ApiError::Gone("step already terminal".into()));
    }
    if let Some(runner_id) = record.runner_id {
        state.runners.heartbeat(ResourceId::from(runner_id)).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct LogLineResponse {
    seq: i64,
    content: String,
}

#[derive(Debug, serde::Deserialize)]
struct LogQuery {
    /// Return only the last N lines (failed cards show this tail).
    tail: Option<i64>,
}

/// Read side, for the UI and the CLI.
async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    axum::extract::Query(query): axum::extract::Query<LogQuery>,
) -> Result<Json<Vec<LogLineResponse>>, ApiError> {
    let id = ResourceId::from(id);
    let records = match query.tail {
        Some(n) => state.logs.tail(id, n.max(0)).await?,
        None => state.logs.for_execution(id).await?,
    };
    Ok(Json(
        records
            .into_iter()
            .map(|r| LogLineResponse {
                seq: r.seq,
                content: r.content,
            })
            .collect(),
    ))
}
