//! Trigger service: turns external events into pipeline runs, deduplicating
//! by trigger key within the rolling window.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lazyaf_config::{PIPELINE_DIR, Settings, parse_pipeline_yaml};
use lazyaf_core::card::CardStatus;
use lazyaf_core::pipeline::StepsGraph;
use lazyaf_core::trigger::{
    TriggerContext, TriggerEvent, TriggerSpec, branch_matches, branch_of_ref,
};
use lazyaf_core::{Error, ResourceId, Result};
use lazyaf_db::{CardStore, PipelineStore, RunStore, TriggerStore, runs::NewRun};

use crate::executor::EngineAction;
use crate::git::GitOps;

/// A pipeline definition resolved at trigger time: either a platform row or
/// a repo-side YAML document. Repo definitions win on name clash.
struct ResolvedPipeline {
    pipeline_id: Option<ResourceId>,
    name: String,
    triggers: Vec<TriggerSpec>,
    graph: StepsGraph,
}

pub struct TriggerService {
    settings: Settings,
    cards: CardStore,
    pipelines: PipelineStore,
    runs: RunStore,
    dedup: TriggerStore,
    git: GitOps,
    actions: mpsc::UnboundedSender<EngineAction>,
}

impl TriggerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        cards: CardStore,
        pipelines: PipelineStore,
        runs: RunStore,
        dedup: TriggerStore,
        git: GitOps,
        actions: mpsc::UnboundedSender<EngineAction>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            cards,
            pipelines,
            runs,
            dedup,
            git,
            actions,
        })
    }

    /// Manual run of a known pipeline. The key is unique by construction.
    pub async fn manual(
        &self,
        pipeline_id: ResourceId,
        branch: Option<&str>,
    ) -> Result<ResourceId> {
        let pipeline = self.pipelines.get(pipeline_id).await?;
        let repo_id = ResourceId::from(pipeline.repo_id);
        let run_id = ResourceId::new();
        let event = TriggerEvent::Manual {
            pipeline_id,
            run_id,
        };
        let graph = pipeline.graph()?;
        let branch = match branch {
            Some(b) => b.to_string(),
            None => self.git.head_branch(repo_id).await?,
        };
        let context = TriggerContext {
            repo_id: Some(repo_id),
            branch: Some(branch.clone()),
            ..Default::default()
        };
        self.create_run(
            run_id,
            Some(pipeline_id),
            repo_id,
            &pipeline.name,
            &graph,
            &event,
            &context,
            Some(&branch),
        )
        .await?;
        Ok(run_id)
    }

    /// Card moved to a completing status: fire matching card-complete
    /// triggers across the repo's pipelines.
    pub async fn on_card_complete(&self, card_id: ResourceId, status: CardStatus) -> Result<()> {
        let card = self.cards.get(card_id).await?;
        let repo_id = ResourceId::from(card.repo_id);
        let event = TriggerEvent::CardComplete { card_id, status };

        let git_ref = card.branch_name.clone();
        let resolved = self
            .resolve_pipelines(repo_id, git_ref.as_deref())
            .await?;
        let mut fired = false;
        for pipeline in resolved {
            for spec in &pipeline.triggers {
                let TriggerSpec::CardComplete {
                    status: wanted,
                    on_pass,
                    on_fail,
                } = spec
                else {
                    continue;
                };
                if *wanted != status {
                    continue;
                }
                if !self
                    .dedup
                    .try_record(&event.trigger_key(), event.trigger_type(), None)
                    .await?
                {
                    debug!(card = %card_id, "card trigger deduplicated");
                    return Ok(());
                }
                let run_id = ResourceId::new();
                let context = TriggerContext {
                    card_id: Some(card_id),
                    repo_id: Some(repo_id),
                    branch: card.branch_name.clone(),
                    on_pass: *on_pass,
                    on_fail: *on_fail,
                    ..Default::default()
                };
                self.create_run(
                    run_id,
                    pipeline.pipeline_id,
                    repo_id,
                    &pipeline.name,
                    &pipeline.graph,
                    &event,
                    &context,
                    card.branch_name.as_deref(),
                )
                .await?;
                fired = true;
            }
        }
        if !fired {
            debug!(card = %card_id, %status, "no pipeline matched card event");
        }
        Ok(())
    }

    /// Push received by the internal git server: one event per updated ref.
    pub async fn on_push(
        &self,
        repo_id: ResourceId,
        git_ref: &str,
        old_sha: &str,
        new_sha: &str,
    ) -> Result<()> {
        let Some(branch) = branch_of_ref(git_ref) else {
            debug!(%git_ref, "ignoring non-branch push");
            return Ok(());
        };
        let event = TriggerEvent::Push {
            repo_id,
            git_ref: git_ref.to_string(),
            old_sha: old_sha.to_string(),
            new_sha: new_sha.to_string(),
        };

        let resolved = self.resolve_pipelines(repo_id, Some(branch)).await?;
        for pipeline in resolved {
            let matched = pipeline.triggers.iter().any(|spec| match spec {
                TriggerSpec::Push { branches } => branch_matches(branches, branch),
                _ => false,
            });
            if !matched {
                continue;
            }
            if !self
                .dedup
                .try_record(&event.trigger_key(), event.trigger_type(), None)
                .await?
            {
                info!(repo = %repo_id, %branch, "push trigger deduplicated");
                return Ok(());
            }
            let run_id = ResourceId::new();
            let context = TriggerContext {
                repo_id: Some(repo_id),
                branch: Some(branch.to_string()),
                sha: Some(new_sha.to_string()),
                ..Default::default()
            };
            self.create_run(
                run_id,
                pipeline.pipeline_id,
                repo_id,
                &pipeline.name,
                &pipeline.graph,
                &event,
                &context,
                Some(branch),
            )
            .await?;
        }
        Ok(())
    }

    /// `on_failure = "trigger:{id}"` side action: the id names a pipeline.
    pub async fn fire_by_id(&self, target: &str) -> Result<()> {
        let pipeline_id: ResourceId = target
            .parse()
            .map_err(|_| Error::Validation(format!("bad trigger target: {target}")))?;
        self.manual(pipeline_id, None).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_run(
        &self,
        run_id: ResourceId,
        pipeline_id: Option<ResourceId>,
        repo_id: ResourceId,
        pipeline_name: &str,
        graph: &StepsGraph,
        event: &TriggerEvent,
        context: &TriggerContext,
        branch: Option<&str>,
    ) -> Result<()> {
        graph.validate()?;
        self.runs
            .create(NewRun {
                id: run_id,
                pipeline_id,
                repo_id,
                pipeline_name,
                graph,
                trigger_type: event.trigger_type(),
                trigger_context: context,
                trigger_key: &event.trigger_key(),
                branch,
            })
            .await?;
        info!(
            run = %run_id,
            pipeline = %pipeline_name,
            trigger = event.trigger_type(),
            "pipeline run created"
        );
        let _ = self.actions.send(EngineAction::SpawnRun(run_id));
        Ok(())
    }

    /// Platform definitions plus repo-side `.lazyaf/pipelines/*.yaml` read
    /// live from the branch's HEAD; the repo wins on name clash.
    async fn resolve_pipelines(
        &self,
        repo_id: ResourceId,
        branch: Option<&str>,
    ) -> Result<Vec<ResolvedPipeline>> {
        let mut by_name: HashMap<String, ResolvedPipeline> = HashMap::new();

        for record in self.pipelines.list_by_repo(repo_id).await? {
            let resolved = ResolvedPipeline {
                pipeline_id: Some(ResourceId::from(record.id)),
                name: record.name.clone(),
                triggers: record.trigger_specs()?,
                graph: record.graph()?,
            };
            by_name.insert(record.name, resolved);
        }

        if let Some(branch) = branch {
            for file in self
                .git
                .list_dir_at_ref(repo_id, branch, PIPELINE_DIR)
                .await?
            {
                if !(file.ends_with(".yaml") || file.ends_with(".yml")) {
                    continue;
                }
                let Some(content) = self.git.read_file_at_ref(repo_id, branch, &file).await? else {
                    continue;
                };
                match parse_pipeline_yaml(&content).and_then(|doc| doc.into_graph()) {
                    Ok((name, triggers, graph)) => {
                        by_name.insert(
                            name.clone(),
                            ResolvedPipeline {
                                pipeline_id: None,
                                name,
                                triggers,
                                graph,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(repo = %repo_id, %file, error = %e, "skipping bad pipeline file");
                    }
                }
            }
        }

        let mut resolved: Vec<ResolvedPipeline> = by_name.into_values().collect();
        resolved.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(resolved)
    }

    /// Periodic dedup GC so old keys may fire again.
    pub fn spawn_dedup_gc(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let window = self.settings.trigger_dedup_window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window / 4);
            loop {
                ticker.tick().await;
                match self.dedup.gc(window.as_secs() as i64).await {
                    Ok(0) => {}
                    Ok(n) => debug!(expired = n, "trigger dedup keys expired"),
                    Err(e) => warn!(error = %e, "trigger dedup GC failed"),
                }
            }
        })
    }
}
