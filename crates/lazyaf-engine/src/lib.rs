//! Orchestration engine: pipeline executor, execution router, workspace
//! service, trigger service, and the periodic audits that keep them honest.

pub mod executor;
pub mod git;
pub mod jobs;
pub mod router;
pub mod trigger;
pub mod workspace;

pub use executor::{EngineAction, PipelineExecutor};
pub use git::GitOps;
pub use jobs::JobService;
pub use router::{ExecutionRouter, RouteTarget, RoutingDecision};
pub use trigger::TriggerService;
pub use workspace::WorkspaceService;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use lazyaf_core::ResourceId;

/// Wires the services together and drives the action loop. One engine per
/// backend process.
pub struct Engine {
    pub executor: Arc<PipelineExecutor>,
    pub triggers: Arc<TriggerService>,
    pub jobs: Arc<JobService>,
    pub workspace: Arc<WorkspaceService>,
    action_rx: mpsc::UnboundedReceiver<EngineAction>,
}

impl Engine {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        triggers: Arc<TriggerService>,
        jobs: Arc<JobService>,
        workspace: Arc<WorkspaceService>,
        action_rx: mpsc::UnboundedReceiver<EngineAction>,
    ) -> Self {
        Self {
            executor,
            triggers,
            jobs,
            workspace,
            action_rx,
        }
    }

    /// Re-enter every non-terminal run, then process actions forever.
    pub async fn run(mut self) {
        match self.executor.non_terminal_runs().await {
            Ok(run_ids) => {
                for run_id in run_ids {
                    info!(run = %run_id, "re-entering run after restart");
                    self.spawn_execute(run_id);
                }
            }
            Err(e) => error!(error = %e, "restart recovery scan failed"),
        }

        while let Some(action) = self.action_rx.recv().await {
            match action {
                EngineAction::SpawnRun(run_id) => self.spawn_execute(run_id),
                EngineAction::CardComplete { card_id, status } => {
                    let triggers = self.triggers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = triggers.on_card_complete(card_id, status).await {
                            warn!(card = %card_id, error = %e, "card-complete trigger failed");
                        }
                    });
                }
                EngineAction::FireTrigger(target) => {
                    let triggers = self.triggers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = triggers.fire_by_id(&target).await {
                            warn!(target = %target, error = %e, "side trigger failed");
                        }
                    });
                }
            }
        }
    }

    fn spawn_execute(&self, run_id: ResourceId) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.execute(run_id).await {
                error!(run = %run_id, error = %e, "pipeline run failed to progress");
            }
        });
    }
}
