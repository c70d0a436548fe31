//! Standalone-card jobs: a card's step wrapped in a degenerate single-step
//! pipeline run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use lazyaf_config::Settings;
use lazyaf_core::card::{CardStatus, JobStatus};
use lazyaf_core::events::{Broadcaster, UiEvent};
use lazyaf_core::pipeline::{FailurePolicy, PipelineStep, StepsGraph, SuccessPolicy};
use lazyaf_core::run::RunState;
use lazyaf_core::trigger::TriggerContext;
use lazyaf_core::{ResourceId, Result};
use lazyaf_db::{CardStore, JobRecord, JobStore, PipelineRunRecord, RunStore, runs::NewRun};

use crate::executor::EngineAction;

pub struct JobService {
    settings: Settings,
    cards: CardStore,
    jobs: JobStore,
    runs: RunStore,
    broadcaster: Broadcaster,
    actions: mpsc::UnboundedSender<EngineAction>,
}

impl JobService {
    pub fn new(
        settings: Settings,
        cards: CardStore,
        jobs: JobStore,
        runs: RunStore,
        broadcaster: Broadcaster,
        actions: mpsc::UnboundedSender<EngineAction>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            cards,
            jobs,
            runs,
            broadcaster,
            actions,
        })
    }

    /// Start a card outside any pipeline. Assigns the working branch on
    /// first start (retries reuse it) and spawns the degenerate run.
    pub async fn start_card(&self, card_id: ResourceId) -> Result<JobRecord> {
        let card = self.cards.get(card_id).await?;
        let config = card.config()?;
        let branch = self.cards.ensure_branch(card_id).await?;
        let repo_id = ResourceId::from(card.repo_id);

        let step = PipelineStep {
            id: "card".to_string(),
            name: card.title.clone(),
            config,
            timeout_seconds: self.settings.step_timeout.as_secs(),
            continue_in_context: false,
            on_success: SuccessPolicy::Next,
            on_failure: FailurePolicy::Stop,
            requires: None,
        };
        let graph = StepsGraph::single(step);

        let run_id = ResourceId::new();
        let context = TriggerContext {
            card_id: Some(card_id),
            repo_id: Some(repo_id),
            branch: Some(branch.clone()),
            ..Default::default()
        };
        self.runs
            .create(NewRun {
                id: run_id,
                pipeline_id: None,
                repo_id,
                pipeline_name: &format!("card:{}", card.title),
                graph: &graph,
                trigger_type: "card",
                trigger_context: &context,
                trigger_key: &format!("manual:{card_id}:{run_id}"),
                branch: Some(&branch),
            })
            .await?;

        let job = self.jobs.create(card_id, run_id).await?;
        let job_id = ResourceId::from(job.id);
        self.cards.set_job(card_id, job_id).await?;
        self.cards.set_status(card_id, CardStatus::InProgress).await?;
        info!(card = %card_id, job = %job_id, run = %run_id, "card job started");
        self.broadcaster.send(UiEvent::CardUpdated {
            card_id,
            status: CardStatus::InProgress.to_string(),
        });
        self.broadcaster.send(UiEvent::JobStatus {
            job_id,
            status: JobStatus::Queued.to_string(),
        });

        let _ = self.actions.send(EngineAction::SpawnRun(run_id));
        Ok(job)
    }

    /// Map a finished run back onto its job and card, if any. A passing job
    /// moves the card to review, which may itself fire a pipeline.
    pub async fn on_run_finished(
        &self,
        run: &PipelineRunRecord,
        final_state: RunState,
    ) -> Result<()> {
        let run_id = ResourceId::from(run.id);
        let Some(job) = self.jobs.for_run(run_id).await? else {
            return Ok(());
        };
        let job_id = ResourceId::from(job.id);
        let card_id = ResourceId::from(job.card_id);

        let job_status = match final_state {
            RunState::Completed => JobStatus::Completed,
            _ => JobStatus::Failed,
        };
        self.jobs.set_status(job_id, job_status).await?;
        self.broadcaster.send(UiEvent::JobStatus {
            job_id,
            status: job_status.to_string(),
        });

        let card_status = match final_state {
            RunState::Completed => CardStatus::InReview,
            _ => CardStatus::Failed,
        };
        self.cards.set_status(card_id, card_status).await?;
        self.broadcaster.send(UiEvent::CardUpdated {
            card_id,
            status: card_status.to_string(),
        });
        info!(job = %job_id, card = %card_id, %card_status, "job finished");

        if card_status == CardStatus::InReview {
            let _ = self.actions.send(EngineAction::CardComplete {
                card_id,
                status: CardStatus::InReview,
            });
        }
        Ok(())
    }
}
