//! Pipeline executor: walks a run's step graph to a terminal state,
//! producing exactly-once step executions whose results drive edge
//! selection.
//!
//! The walker recomputes its view (outcomes, frontier, affinity sites) from
//! the execution rows on every iteration, so re-entering a run after a
//! backend restart resumes exactly where it stopped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lazyaf_config::Settings;
use lazyaf_core::card::CardStatus;
use lazyaf_core::events::{Broadcaster, UiEvent};
use lazyaf_core::execution::{ExecutionOutcome, ExecutionRequest, StepExecutor};
use lazyaf_core::pipeline::{FailurePolicy, StepsGraph, SuccessPolicy};
use lazyaf_core::run::RunState;
use lazyaf_core::step::{ExecutionKey, StepOutcome, StepState};
use lazyaf_core::trigger::{FailAction, PassAction};
use lazyaf_core::workspace::{REPO_DIR, workspace_id_for_run};
use lazyaf_core::{Error, ResourceId, Result};
use lazyaf_db::{
    CardStore, PipelineRunRecord, RunStore, StepExecutionRecord, StepStore,
};
use lazyaf_executor::{LocalExecutor, RemoteExecutor};

use crate::git::GitOps;
use crate::jobs::JobService;
use crate::router::{ExecutionRouter, PreviousSite, RouteTarget};
use crate::workspace::WorkspaceService;

/// Side effects the executor hands back to the engine loop instead of
/// calling into the trigger service directly.
#[derive(Debug)]
pub enum EngineAction {
    SpawnRun(ResourceId),
    CardComplete {
        card_id: ResourceId,
        status: CardStatus,
    },
    /// `on_failure = "trigger:{id}"` side action.
    FireTrigger(String),
}

pub struct PipelineExecutor {
    settings: Settings,
    runs: RunStore,
    steps: StepStore,
    cards: CardStore,
    workspace: Arc<WorkspaceService>,
    router: Arc<ExecutionRouter>,
    local: Option<Arc<LocalExecutor>>,
    remote: Arc<RemoteExecutor>,
    git: GitOps,
    jobs: Arc<JobService>,
    broadcaster: Broadcaster,
    actions: mpsc::UnboundedSender<EngineAction>,
}

/// The walker's view of one iteration, derived entirely from rows.
struct WalkView {
    latest: HashMap<String, StepExecutionRecord>,
    outcomes: HashMap<String, StepOutcome>,
    attempts: HashMap<String, u32>,
}

impl PipelineExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        runs: RunStore,
        steps: StepStore,
        cards: CardStore,
        workspace: Arc<WorkspaceService>,
        router: Arc<ExecutionRouter>,
        local: Option<Arc<LocalExecutor>>,
        remote: Arc<RemoteExecutor>,
        git: GitOps,
        jobs: Arc<JobService>,
        broadcaster: Broadcaster,
        actions: mpsc::UnboundedSender<EngineAction>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            runs,
            steps,
            cards,
            workspace,
            router,
            local,
            remote,
            git,
            jobs,
            broadcaster,
            actions,
        })
    }

    /// Run ids needing re-entry after restart.
    pub async fn non_terminal_runs(&self) -> Result<Vec<ResourceId>> {
        Ok(self
            .runs
            .non_terminal()
            .await?
            .into_iter()
            .map(|r| ResourceId::from(r.id))
            .collect())
    }

    /// Progress a run from its current state to a terminal state. Idempotent
    /// on restart; refuses nothing except terminal runs.
    pub async fn execute(&self, run_id: ResourceId) -> Result<()> {
        let run = self.runs.get(run_id).await?;
        let state = run.state()?;
        if state.is_terminal() {
            debug!(run = %run_id, %state, "run already terminal");
            return Ok(());
        }

        let graph = run.graph()?;
        if let Err(e) = graph.validate() {
            return self.fail_run(&run, &format!("invalid pipeline graph: {e}")).await;
        }

        if state == RunState::Pending {
            self.transition_run(&run, &[RunState::Pending], RunState::Preparing)
                .await?;
        }

        let repo_id = ResourceId::from(run.repo_id);
        let workspace = match self
            .workspace
            .get_or_create(run_id, repo_id, run.branch.as_deref())
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                return self
                    .fail_run(&run, &format!("workspace unavailable: {e}"))
                    .await;
            }
        };

        self.transition_run(&run, &[RunState::Preparing], RunState::Running)
            .await?;

        let verdict = self.walk(&run, &graph, &workspace.id).await?;
        self.finish(&run, &graph, verdict).await
    }

    /// Cooperative cancellation: mark the run, notify in-flight executors,
    /// leave executed steps untouched. Idempotent.
    pub async fn cancel(&self, run_id: ResourceId, reason: &str) -> Result<()> {
        let run = self.runs.get(run_id).await?;
        if run.state()?.is_terminal() {
            return Ok(());
        }
        let moved = self
            .runs
            .transition(
                run_id,
                &[
                    RunState::Pending,
                    RunState::Preparing,
                    RunState::Running,
                    RunState::Completing,
                ],
                RunState::Cancelled,
            )
            .await?;
        if !moved {
            return Ok(());
        }
        self.runs.set_failure_reason(run_id, reason).await?;
        info!(run = %run_id, %reason, "run cancelled");

        for record in self.steps.for_run(run_id).await? {
            if record.state()?.is_terminal() {
                continue;
            }
            let id = ResourceId::from(record.id);
            let result = if record.runner_id.is_some() {
                self.remote.cancel(id).await
            } else if let Some(local) = &self.local {
                local.cancel(id).await
            } else {
                self.remote.cancel(id).await
            };
            if let Err(e) = result {
                warn!(step = %id, error = %e, "step cancellation failed");
            }
        }

        self.publish_run(&run, RunState::Cancelled).await;
        self.jobs.on_run_finished(&run, RunState::Cancelled).await?;
        let _ = self.workspace.cleanup(&workspace_id_for_run(run_id)).await;
        Ok(())
    }

    /// One pass over the rows: latest execution and outcome per step.
    async fn view(&self, run_id: ResourceId) -> Result<WalkView> {
        let mut latest: HashMap<String, StepExecutionRecord> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        for record in self.steps.for_run(run_id).await? {
            *attempts.entry(record.step_id.clone()).or_insert(0) += 1;
            match latest.get(&record.step_id) {
                Some(existing) if existing.attempt >= record.attempt => {}
                _ => {
                    latest.insert(record.step_id.clone(), record);
                }
            }
        }
        let mut outcomes = HashMap::new();
        for (step_id, record) in &latest {
            if let Some(outcome) = record.state()?.outcome() {
                outcomes.insert(step_id.clone(), outcome);
            }
        }
        Ok(WalkView {
            latest,
            outcomes,
            attempts,
        })
    }

    /// Steps whose inbound edges are all satisfied and which have no
    /// terminal execution yet, ordered by entry declaration then by the
    /// stable insertion order of their first inbound edge.
    fn frontier(graph: &StepsGraph, view: &WalkView) -> Vec<String> {
        let entry_points = graph.effective_entry_points();
        let mut ordered: Vec<(usize, String)> = Vec::new();

        for step_id in graph.steps.keys() {
            if view.outcomes.contains_key(step_id) {
                continue;
            }
            let inbound: Vec<_> = graph.inbound(step_id).collect();
            let satisfied = if inbound.is_empty() {
                entry_points.contains(step_id)
            } else {
                inbound.iter().all(|edge| {
                    view.outcomes
                        .get(&edge.from)
                        .map(|outcome| edge.condition.matches(*outcome))
                        .unwrap_or(false)
                })
            };
            if !satisfied {
                continue;
            }
            let rank = if inbound.is_empty() {
                entry_points.iter().position(|e| e == step_id).unwrap_or(0)
            } else {
                graph
                    .edges
                    .iter()
                    .position(|e| &e.to == step_id)
                    .unwrap_or(usize::MAX)
                    + entry_points.len()
            };
            ordered.push((rank, step_id.clone()));
        }
        ordered.sort();
        ordered.into_iter().map(|(_, id)| id).collect()
    }

    /// Affinity: the site of an inbound `continue_in_context` predecessor
    /// whose edge matched, resolved from execution rows.
    fn previous_site(
        graph: &StepsGraph,
        view: &WalkView,
        step_id: &str,
    ) -> Option<PreviousSite> {
        for edge in graph.inbound(step_id) {
            let Some(outcome) = view.outcomes.get(&edge.from) else {
                continue;
            };
            if !edge.condition.matches(*outcome) {
                continue;
            }
            let from_step = graph.steps.get(&edge.from)?;
            if !from_step.continue_in_context {
                continue;
            }
            let record = view.latest.get(&edge.from)?;
            return Some(match record.runner_id {
                Some(runner) => PreviousSite::Remote(ResourceId::from(runner)),
                None => PreviousSite::Local,
            });
        }
        None
    }

    /// What the walk concluded.
    async fn walk(
        &self,
        run: &PipelineRunRecord,
        graph: &StepsGraph,
        workspace_id: &str,
    ) -> Result<WalkVerdict> {
        let run_id = ResourceId::from(run.id);
        loop {
            // Cancellation is cooperative: stop walking once observed.
            if self.runs.get(run_id).await?.state()? == RunState::Cancelled {
                return Ok(WalkVerdict {
                    failed: true,
                    reason: Some("cancelled".into()),
                    merge: None,
                });
            }

            let view = self.view(run_id).await?;

            // Policies of already-terminal steps decide early exits. Scan
            // everything first so a merge policy is never lost to map order.
            let mut merge = None;
            let mut stop_success = false;
            let mut fatal: Option<String> = None;
            for (step_id, outcome) in &view.outcomes {
                let Some(step) = graph.steps.get(step_id) else {
                    continue;
                };
                match outcome {
                    StepOutcome::Success => match &step.on_success {
                        SuccessPolicy::Stop => stop_success = true,
                        SuccessPolicy::Merge(branch) => merge = Some(branch.clone()),
                        SuccessPolicy::Next => {}
                    },
                    StepOutcome::Failure => match &step.on_failure {
                        FailurePolicy::Stop => {
                            fatal.get_or_insert_with(|| format!("step {step_id} failed"));
                        }
                        FailurePolicy::Next | FailurePolicy::Trigger(_) => {}
                    },
                }
            }
            if let Some(reason) = fatal {
                return Ok(WalkVerdict {
                    failed: true,
                    reason: Some(reason),
                    merge: None,
                });
            }
            if stop_success {
                info!(run = %run_id, "on_success=stop, ending run");
                return Ok(WalkVerdict {
                    failed: false,
                    reason: None,
                    merge,
                });
            }

            let frontier = Self::frontier(graph, &view);
            let Some(step_id) = frontier.first().cloned() else {
                return Ok(WalkVerdict {
                    failed: false,
                    reason: None,
                    merge,
                });
            };

            self.dispatch(run, graph, workspace_id, &view, &step_id)
                .await?;
        }
    }

    /// Create (or attach to) the execution row for a frontier step and hand
    /// it to the routed executor, serially.
    async fn dispatch(
        &self,
        run: &PipelineRunRecord,
        graph: &StepsGraph,
        workspace_id: &str,
        view: &WalkView,
        step_id: &str,
    ) -> Result<()> {
        let run_id = ResourceId::from(run.id);
        let step = graph
            .steps
            .get(step_id)
            .ok_or_else(|| Error::Internal(format!("frontier step {step_id} missing")))?
            .clone();

        self.runs
            .set_progress(run_id, Some(step_id), view.outcomes.len() as i32)
            .await?;
        self.broadcaster.send(UiEvent::PipelineRunStatus {
            pipeline_run_id: run_id,
            status: RunState::Running.to_string(),
            steps_completed: view.outcomes.len() as u32,
            steps_total: graph.steps.len() as u32,
        });

        let step_run = self
            .steps
            .get_or_create_step_run(run_id, step_id, &step.name)
            .await?;

        // Attach to a live attempt, or mint the next one. Terminal rows
        // never reach here (their outcome is in the view).
        let attempt = match view.latest.get(step_id) {
            Some(record) => record.attempt as u32,
            None => *view.attempts.get(step_id).unwrap_or(&0),
        };
        let index = graph
            .step_index(step_id)
            .ok_or_else(|| Error::Internal(format!("step {step_id} has no index")))?;
        let key = ExecutionKey::new(run_id, index, attempt);
        let (execution, created) = self
            .steps
            .create_execution(ResourceId::from(step_run.id), &key, step_id)
            .await?;
        if created {
            debug!(run = %run_id, step = %step_id, %key, "execution created");
        }

        let decision = self
            .router
            .route(&step, Self::previous_site(graph, view, step_id));
        let request = ExecutionRequest {
            step_execution_id: ResourceId::from(execution.id),
            execution_key: key,
            pipeline_run_id: run_id,
            workspace_id: workspace_id.to_string(),
            step: step.clone(),
            pinned_runner_id: decision.pinned_runner_id,
        };

        self.steps
            .set_step_run_status(ResourceId::from(step_run.id), StepState::Running)
            .await?;

        let outcome = match decision.target {
            RouteTarget::Local => match &self.local {
                Some(local) => local.execute(request).await,
                None => self.remote.execute(request).await,
            },
            RouteTarget::Remote => self.remote.execute(request).await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Executor-level error (resource or infrastructure): the
                // step fails with the reason; the pipeline reacts via edges.
                warn!(run = %run_id, step = %step_id, error = %e, "executor error");
                self.steps
                    .transition(
                        ResourceId::from(execution.id),
                        &[
                            StepState::Pending,
                            StepState::Assigned,
                            StepState::Preparing,
                            StepState::Running,
                        ],
                        StepState::Failed,
                        None,
                        Some(&e.to_string()),
                    )
                    .await?;
                ExecutionOutcome::failed(None)
            }
        };

        self.steps
            .set_step_run_status(ResourceId::from(step_run.id), outcome.state)
            .await?;

        if outcome.state.outcome() == Some(StepOutcome::Failure) {
            if let FailurePolicy::Trigger(target) = &step.on_failure {
                info!(run = %run_id, step = %step_id, %target, "firing failure side trigger");
                let _ = self
                    .actions
                    .send(EngineAction::FireTrigger(target.clone()));
            }
        }
        Ok(())
    }

    /// Completing phase: merge action, context-cleanup commit, terminal
    /// transition, trigger action hook, workspace teardown.
    async fn finish(
        &self,
        run: &PipelineRunRecord,
        graph: &StepsGraph,
        verdict: WalkVerdict,
    ) -> Result<()> {
        let run_id = ResourceId::from(run.id);
        if !self
            .runs
            .transition(run_id, &[RunState::Running], RunState::Completing)
            .await?
        {
            match self.runs.get(run_id).await?.state()? {
                // A restart mid-completion re-enters here; the merge and
                // context commit are both idempotent.
                RunState::Completing => {}
                // Cancellation won the race; its own teardown applies.
                _ => return Ok(()),
            }
        }

        let mut failed = verdict.failed;
        let mut reason = verdict.reason;

        if !failed {
            if let (Some(target), Some(branch)) = (&verdict.merge, &run.branch) {
                let repo_id = ResourceId::from(run.repo_id);
                if let Err(e) = self.git.merge_branch(repo_id, branch, target).await {
                    warn!(run = %run_id, error = %e, "merge action failed");
                    failed = true;
                    reason = Some(format!("merge into {target} failed: {e}"));
                }
            }
        }

        // Context cleanup: commit whatever the steps left in
        // `.lazyaf-context/` back to the working branch.
        if let Some(branch) = &run.branch {
            let workspace_root = self
                .settings
                .workspace_dir(&workspace_id_for_run(run_id));
            if workspace_root.join(REPO_DIR).exists() {
                if let Err(e) = self.git.commit_context(&workspace_root, branch).await {
                    warn!(run = %run_id, error = %e, "context commit failed");
                }
            }
        }

        let final_state = if failed { RunState::Failed } else { RunState::Completed };
        self.runs
            .transition(run_id, &[RunState::Completing], final_state)
            .await?;
        if let Some(reason) = &reason {
            self.runs.set_failure_reason(run_id, reason).await?;
        }
        let view = self.view(run_id).await?;
        self.runs
            .set_progress(run_id, None, view.outcomes.len() as i32)
            .await?;
        info!(run = %run_id, state = %final_state, "run finished");
        self.broadcaster.send(UiEvent::PipelineRunStatus {
            pipeline_run_id: run_id,
            status: final_state.to_string(),
            steps_completed: view.outcomes.len() as u32,
            steps_total: graph.steps.len() as u32,
        });

        self.apply_trigger_actions(run, final_state).await?;
        self.jobs.on_run_finished(run, final_state).await?;
        let _ = self.workspace.cleanup(&workspace_id_for_run(run_id)).await;
        Ok(())
    }

    /// Execute the action plan stored in the run's trigger context against
    /// the originating card.
    async fn apply_trigger_actions(
        &self,
        run: &PipelineRunRecord,
        final_state: RunState,
    ) -> Result<()> {
        let context = run.context()?;
        let Some(card_id) = context.card_id else {
            return Ok(());
        };
        let repo_id = ResourceId::from(run.repo_id);

        let new_status = match final_state {
            RunState::Completed => match context.on_pass {
                Some(PassAction::Merge) => {
                    let card = self.cards.get(card_id).await?;
                    let branch = run.branch.as_deref().or(card.branch_name.as_deref());
                    if let Some(branch) = branch {
                        let default_branch = self.git.head_branch(repo_id).await?;
                        self.git
                            .merge_branch(repo_id, branch, &default_branch)
                            .await?;
                    }
                    Some(CardStatus::Done)
                }
                Some(PassAction::Done) => Some(CardStatus::Done),
                None => None,
            },
            RunState::Failed => match context.on_fail {
                Some(FailAction::Fail) => Some(CardStatus::Failed),
                Some(FailAction::Reject) => Some(CardStatus::Todo),
                None => None,
            },
            _ => None,
        };

        if let Some(status) = new_status {
            self.cards.set_status(card_id, status).await?;
            info!(card = %card_id, %status, "trigger action applied");
            self.broadcaster.send(UiEvent::CardUpdated {
                card_id,
                status: status.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_run(&self, run: &PipelineRunRecord, reason: &str) -> Result<()> {
        let run_id = ResourceId::from(run.id);
        warn!(run = %run_id, %reason, "failing run");
        self.runs
            .transition(
                run_id,
                &[RunState::Pending, RunState::Preparing, RunState::Running],
                RunState::Failed,
            )
            .await?;
        self.runs.set_failure_reason(run_id, reason).await?;
        self.publish_run(run, RunState::Failed).await;
        self.jobs.on_run_finished(run, RunState::Failed).await?;
        Ok(())
    }

    async fn transition_run(
        &self,
        run: &PipelineRunRecord,
        from: &[RunState],
        to: RunState,
    ) -> Result<()> {
        if self
            .runs
            .transition(ResourceId::from(run.id), from, to)
            .await?
        {
            self.publish_run(run, to).await;
        }
        Ok(())
    }

    async fn publish_run(&self, run: &PipelineRunRecord, state: RunState) {
        self.broadcaster.send(UiEvent::PipelineRunStatus {
            pipeline_run_id: ResourceId::from(run.id),
            status: state.to_string(),
            steps_completed: run.steps_completed.max(0) as u32,
            steps_total: run.steps_total.max(0) as u32,
        });
    }
}

/// What the walk concluded about the run.
struct WalkVerdict {
    failed: bool,
    reason: Option<String>,
    merge: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyaf_core::pipeline::{Edge, EdgeCondition, PipelineStep};
    use lazyaf_core::step::StepConfig;

    fn script_step(id: &str, on_success: SuccessPolicy, continue_in_context: bool) -> PipelineStep {
        PipelineStep {
            id: id.into(),
            name: id.into(),
            config: StepConfig::Script {
                command: "true".into(),
                working_dir: None,
            },
            timeout_seconds: 300,
            continue_in_context,
            on_success,
            on_failure: FailurePolicy::Stop,
            requires: None,
        }
    }

    fn two_step_graph() -> StepsGraph {
        let mut graph = StepsGraph::default();
        graph.steps.insert(
            "a".into(),
            script_step("a", SuccessPolicy::Next, true),
        );
        graph.steps.insert(
            "b".into(),
            script_step("b", SuccessPolicy::Next, false),
        );
        graph.edges.push(Edge {
            from: "a".into(),
            to: "b".into(),
            condition: EdgeCondition::Success,
        });
        graph.entry_points.push("a".into());
        graph
    }

    fn record(step_id: &str, status: &str, runner: Option<uuid::Uuid>) -> StepExecutionRecord {
        StepExecutionRecord {
            id: uuid::Uuid::now_v7(),
            step_run_id: uuid::Uuid::now_v7(),
            pipeline_run_id: uuid::Uuid::now_v7(),
            step_id: step_id.into(),
            execution_key: format!("k:{step_id}"),
            attempt: 0,
            status: status.into(),
            runner_id: runner,
            container_id: None,
            exit_code: None,
            failure_reason: None,
            step_token_digest: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn view_of(records: Vec<StepExecutionRecord>) -> WalkView {
        let mut latest = HashMap::new();
        let mut attempts = HashMap::new();
        for r in records {
            *attempts.entry(r.step_id.clone()).or_insert(0u32) += 1;
            latest.insert(r.step_id.clone(), r);
        }
        let mut outcomes = HashMap::new();
        for (id, r) in &latest {
            if let Some(o) = StepState::parse(&r.status).and_then(|s| s.outcome()) {
                outcomes.insert(id.clone(), o);
            }
        }
        WalkView {
            latest,
            outcomes,
            attempts,
        }
    }

    #[test]
    fn frontier_starts_at_entry_points() {
        let graph = two_step_graph();
        let view = view_of(vec![]);
        assert_eq!(PipelineExecutor::frontier(&graph, &view), vec!["a"]);
    }

    #[test]
    fn frontier_advances_on_success() {
        let graph = two_step_graph();
        let view = view_of(vec![record("a", "completed", None)]);
        assert_eq!(PipelineExecutor::frontier(&graph, &view), vec!["b"]);
    }

    #[test]
    fn failure_does_not_satisfy_success_edge() {
        let graph = two_step_graph();
        let view = view_of(vec![record("a", "failed", None)]);
        assert!(PipelineExecutor::frontier(&graph, &view).is_empty());
    }

    #[test]
    fn always_edge_follows_failure() {
        let mut graph = two_step_graph();
        graph.edges[0].condition = EdgeCondition::Always;
        let view = view_of(vec![record("a", "timeout", None)]);
        assert_eq!(PipelineExecutor::frontier(&graph, &view), vec!["b"]);
    }

    #[test]
    fn in_flight_steps_are_still_frontier() {
        // Non-terminal latest execution: the walker must reattach, so the
        // step stays in the frontier.
        let graph = two_step_graph();
        let view = view_of(vec![record("a", "running", None)]);
        assert_eq!(PipelineExecutor::frontier(&graph, &view), vec!["a"]);
    }

    #[test]
    fn previous_site_tracks_remote_runner() {
        let graph = two_step_graph();
        let runner = uuid::Uuid::now_v7();
        let view = view_of(vec![record("a", "completed", Some(runner))]);
        match PipelineExecutor::previous_site(&graph, &view, "b") {
            Some(PreviousSite::Remote(id)) => assert_eq!(*id.as_uuid(), runner),
            other => panic!("expected remote site, got {other:?}"),
        }
    }

    #[test]
    fn previous_site_is_local_without_runner() {
        let graph = two_step_graph();
        let view = view_of(vec![record("a", "completed", None)]);
        assert!(matches!(
            PipelineExecutor::previous_site(&graph, &view, "b"),
            Some(PreviousSite::Local)
        ));
    }

    #[test]
    fn no_affinity_without_continue_in_context() {
        let mut graph = two_step_graph();
        graph.steps.get_mut("a").unwrap().continue_in_context = false;
        let view = view_of(vec![record("a", "completed", None)]);
        assert!(PipelineExecutor::previous_site(&graph, &view, "b").is_none());
    }
}
