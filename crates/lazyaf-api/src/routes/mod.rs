//! API routes.

pub mod cards;
pub mod health;
pub mod pipelines;
pub mod repos;
pub mod runners;
pub mod runs;
pub mod steps;
pub mod workspaces;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use crate::AppState;
use crate::git;
use crate::runner_ws::runner_ws_handler;
use crate::ws::ws_handler;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    // Pushes and workspace snapshots carry large bodies.
    let body_limit = state.settings.workspace_transfer_max_bytes as usize;

    Router::new()
        .nest("/api", api_router())
        .merge(git_router())
        .route("/ws", get(ws_handler))
        .route("/ws/runner", get(runner_ws_handler))
        .merge(health::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/repos", repos::router())
        .nest("/cards", cards::router())
        .nest("/pipelines", pipelines::router())
        .nest("/runs", runs::router())
        .nest("/runners", runners::router())
        .nest("/steps", steps::router())
        .nest("/workspaces", workspaces::router())
        .route("/jobs/{id}", get(cards::get_job))
}

fn git_router() -> Router<AppState> {
    Router::new()
        .route("/git/{repo}/info/refs", get(git::info_refs))
        .route("/git/{repo}/git-upload-pack", post(git::upload_pack))
        .route("/git/{repo}/git-receive-pack", post(git::receive_pack))
        .route("/git/{repo}/HEAD", get(git::head))
}
