//! Pipeline run store. Transitions are guarded so observers never see a
//! state regress.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::pipeline::StepsGraph;
use lazyaf_core::run::RunState;
use lazyaf_core::trigger::TriggerContext;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRunRecord {
    pub id: uuid::Uuid,
    pub pipeline_id: Option<uuid::Uuid>,
    pub repo_id: uuid::Uuid,
    pub pipeline_name: String,
    pub steps_graph: serde_json::Value,
    pub status: String,
    pub current_step_id: Option<String>,
    pub steps_completed: i32,
    pub steps_total: i32,
    pub trigger_type: String,
    pub trigger_context: serde_json::Value,
    pub trigger_key: String,
    pub branch: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRunRecord {
    pub fn state(&self) -> DbResult<RunState> {
        RunState::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("run {} status {}", self.id, self.status)))
    }

    pub fn graph(&self) -> DbResult<StepsGraph> {
        serde_json::from_value(self.steps_graph.clone())
            .map_err(|e| DbError::Corrupt(format!("run {} graph: {e}", self.id)))
    }

    pub fn context(&self) -> DbResult<TriggerContext> {
        serde_json::from_value(self.trigger_context.clone())
            .map_err(|e| DbError::Corrupt(format!("run {} trigger_context: {e}", self.id)))
    }
}

pub struct NewRun<'a> {
    pub id: ResourceId,
    pub pipeline_id: Option<ResourceId>,
    pub repo_id: ResourceId,
    pub pipeline_name: &'a str,
    pub graph: &'a StepsGraph,
    pub trigger_type: &'a str,
    pub trigger_context: &'a TriggerContext,
    pub trigger_key: &'a str,
    pub branch: Option<&'a str>,
}

#[derive(Clone)]
pub struct RunStore {
    pool: PgPool,
}

impl RunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewRun<'_>) -> DbResult<PipelineRunRecord> {
        let record = sqlx::query_as::<_, PipelineRunRecord>(
            r#"
            INSERT INTO pipeline_runs
                (id, pipeline_id, repo_id, pipeline_name, steps_graph, status,
                 steps_total, trigger_type, trigger_context, trigger_key, branch)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(new.id.as_uuid())
        .bind(new.pipeline_id.map(|p| *p.as_uuid()))
        .bind(new.repo_id.as_uuid())
        .bind(new.pipeline_name)
        .bind(serde_json::to_value(new.graph).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .bind(new.graph.steps.len() as i32)
        .bind(new.trigger_type)
        .bind(
            serde_json::to_value(new.trigger_context)
                .map_err(|e| DbError::Corrupt(e.to_string()))?,
        )
        .bind(new.trigger_key)
        .bind(new.branch)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<PipelineRunRecord> {
        sqlx::query_as::<_, PipelineRunRecord>("SELECT * FROM pipeline_runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline run {id}")))
    }

    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<PipelineRunRecord>> {
        let records = sqlx::query_as::<_, PipelineRunRecord>(
            "SELECT * FROM pipeline_runs ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_for_pipeline(
        &self,
        pipeline_id: ResourceId,
        limit: i64,
    ) -> DbResult<Vec<PipelineRunRecord>> {
        let records = sqlx::query_as::<_, PipelineRunRecord>(
            "SELECT * FROM pipeline_runs WHERE pipeline_id = $1 ORDER BY started_at DESC LIMIT $2",
        )
        .bind(pipeline_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Runs the executor must re-enter after a backend restart.
    pub async fn non_terminal(&self) -> DbResult<Vec<PipelineRunRecord>> {
        let records = sqlx::query_as::<_, PipelineRunRecord>(
            "SELECT * FROM pipeline_runs
             WHERE status NOT IN ('completed', 'failed', 'cancelled')
             ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Guarded transition. Returns false when the run was not in any of the
    /// `from` states (someone else won the race).
    pub async fn transition(
        &self,
        id: ResourceId,
        from: &[RunState],
        to: RunState,
    ) -> DbResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let completed_at = to.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2, completed_at = COALESCE($3, completed_at)
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.to_string())
        .bind(completed_at)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_failure_reason(&self, id: ResourceId, reason: &str) -> DbResult<()> {
        sqlx::query("UPDATE pipeline_runs SET failure_reason = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_progress(
        &self,
        id: ResourceId,
        current_step_id: Option<&str>,
        steps_completed: i32,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE pipeline_runs SET current_step_id = $2, steps_completed = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(current_step_id)
        .bind(steps_completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
