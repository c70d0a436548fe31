//! LazyAF backend server.

use lazyaf_api::{AppState, routes};
use lazyaf_config::Settings;
use lazyaf_db::{create_pool, run_migrations};
use lazyaf_engine::Engine;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    tokio::fs::create_dir_all(settings.git_repos_dir()).await?;
    tokio::fs::create_dir_all(settings.workspaces_dir()).await?;
    tokio::fs::create_dir_all(settings.snapshots_dir()).await?;

    info!("Connecting to database...");
    let pool = create_pool(&settings.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database ready");

    let (state, action_rx) = AppState::new(settings.clone(), pool);

    // Reconcile leftover containers from a previous backend.
    if settings.use_local_executor {
        match bollard::Docker::connect_with_local_defaults() {
            Ok(docker) => {
                if let Err(e) =
                    lazyaf_executor::recover_local_containers(&docker, &state.steps).await
                {
                    warn!(error = %e, "container recovery sweep failed");
                }
            }
            Err(e) => warn!(error = %e, "Docker unavailable, skipping recovery sweep"),
        }
    }

    // Background tasks: engine loop, runner watchdog, workspace auditor,
    // trigger dedup GC.
    let engine = Engine::new(
        state.executor.clone(),
        state.triggers.clone(),
        state.jobs.clone(),
        state.workspace.clone(),
        action_rx,
    );
    tokio::spawn(engine.run());
    state.gateway.clone().spawn_watchdog();
    state.workspace.clone().spawn_auditor();
    state.triggers.clone().spawn_dedup_gc();

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", settings.bind_addr);
    let listener = TcpListener::bind(settings.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
