//! Application state: stores, services, and the live connection registries.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

use lazyaf_config::Settings;
use lazyaf_core::events::Broadcaster;
use lazyaf_db::{
    CardStore, JobStore, LogStore, PipelineStore, RepoStore, RunStore, RunnerStore, StepStore,
    TriggerStore, WorkspaceStore,
};
use lazyaf_engine::{
    EngineAction, ExecutionRouter, GitOps, JobService, PipelineExecutor, TriggerService,
    WorkspaceService,
};
use lazyaf_executor::{LocalExecutor, RemoteExecutor, RunnerGateway, RunnerRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub pool: PgPool,
    pub repos: RepoStore,
    pub cards: CardStore,
    pub pipelines: PipelineStore,
    pub runs: RunStore,
    pub steps: StepStore,
    pub logs: LogStore,
    pub runners: RunnerStore,
    pub jobs_store: JobStore,
    pub broadcaster: Broadcaster,
    pub git: GitOps,
    pub registry: Arc<RunnerRegistry>,
    pub gateway: Arc<RunnerGateway>,
    pub executor: Arc<PipelineExecutor>,
    pub triggers: Arc<TriggerService>,
    pub jobs: Arc<JobService>,
    pub workspace: Arc<WorkspaceService>,
    pub actions: mpsc::UnboundedSender<EngineAction>,
}

impl AppState {
    /// Wire every store and service. Returns the state together with the
    /// action receiver the engine loop consumes.
    pub fn new(
        settings: Settings,
        pool: PgPool,
    ) -> (Self, mpsc::UnboundedReceiver<EngineAction>) {
        let repos = RepoStore::new(pool.clone());
        let cards = CardStore::new(pool.clone());
        let pipelines = PipelineStore::new(pool.clone());
        let runs = RunStore::new(pool.clone());
        let steps = StepStore::new(pool.clone());
        let logs = LogStore::new(pool.clone());
        let runners = RunnerStore::new(pool.clone());
        let jobs_store = JobStore::new(pool.clone());
        let workspaces_store = WorkspaceStore::new(pool.clone());
        let dedup = TriggerStore::new(pool.clone());

        let broadcaster = Broadcaster::new();
        let git = GitOps::new(settings.clone());
        let registry = RunnerRegistry::new();
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        let gateway = Arc::new(RunnerGateway::new(
            registry.clone(),
            settings.clone(),
            steps.clone(),
            runners.clone(),
            logs.clone(),
            broadcaster.clone(),
        ));

        let workspace = WorkspaceService::new(
            settings.clone(),
            workspaces_store.clone(),
            git.clone(),
        );
        let router = ExecutionRouter::new(settings.clone());

        let local = if settings.use_local_executor {
            match LocalExecutor::new(
                settings.clone(),
                steps.clone(),
                logs.clone(),
                workspaces_store.clone(),
                broadcaster.clone(),
            ) {
                Ok(local) => Some(Arc::new(local)),
                Err(e) => {
                    tracing::warn!(error = %e, "Docker unavailable, all steps go remote");
                    None
                }
            }
        } else {
            None
        };
        let remote = Arc::new(RemoteExecutor::new(
            registry.clone(),
            settings.clone(),
            steps.clone(),
            runners.clone(),
            workspaces_store.clone(),
            broadcaster.clone(),
        ));

        let jobs = JobService::new(
            settings.clone(),
            cards.clone(),
            jobs_store.clone(),
            runs.clone(),
            broadcaster.clone(),
            action_tx.clone(),
        );

        let executor = PipelineExecutor::new(
            settings.clone(),
            runs.clone(),
            steps.clone(),
            cards.clone(),
            workspace.clone(),
            router,
            local,
            remote,
            git.clone(),
            jobs.clone(),
            broadcaster.clone(),
            action_tx.clone(),
        );

        let triggers = TriggerService::new(
            settings.clone(),
            cards.clone(),
            pipelines.clone(),
            runs.clone(),
            dedup,
            git.clone(),
            action_tx.clone(),
        );

        let state = Self {
            settings,
            pool,
            repos,
            cards,
            pipelines,
            runs,
            steps,
            logs,
            runners,
            jobs_store,
            broadcaster,
            git,
            registry,
            gateway,
            executor,
            triggers,
            jobs,
            workspace,
            actions: action_tx,
        };
        (state, action_rx)
    }
}
