//! Step runs (logical) and step executions (physical attempts).
//!
//! The unique constraint on `execution_key` is the idempotency primitive:
//! `create_execution` either inserts the row or returns the existing one,
//! and every transition is guarded by the legal-predecessor set.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::step::{ExecutionKey, StepState};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRunRecord {
    pub id: uuid::Uuid,
    pub pipeline_run_id: uuid::Uuid,
    pub step_id: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepExecutionRecord {
    pub id: uuid::Uuid,
    pub step_run_id: uuid::Uuid,
    pub pipeline_run_id: uuid::Uuid,
    pub step_id: String,
    pub execution_key: String,
    pub attempt: i32,
    pub status: String,
    pub runner_id: Option<uuid::Uuid>,
    pub container_id: Option<String>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub step_token_digest: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecutionRecord {
    pub fn state(&self) -> DbResult<StepState> {
        StepState::parse(&self.status).ok_or_else(|| {
            DbError::Corrupt(format!("execution {} status {}", self.id, self.status))
        })
    }
}

#[derive(Clone)]
pub struct StepStore {
    pool: PgPool,
}

impl StepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_or_create_step_run(
        &self,
        pipeline_run_id: ResourceId,
        step_id: &str,
        name: &str,
    ) -> DbResult<StepRunRecord> {
        sqlx::query_as::<_, StepRunRecord>(
            r#"
            INSERT INTO step_runs (id, pipeline_run_id, step_id, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (pipeline_run_id, step_id) DO UPDATE SET name = EXCLUDED.name
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(pipeline_run_id.as_uuid())
        .bind(step_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_step_run_status(&self, id: ResourceId, status: StepState) -> DbResult<()> {
        let (started, completed) = match status {
            StepState::Running => (Some(Utc::now()), None),
            s if s.is_terminal() => (None, Some(Utc::now())),
            _ => (None, None),
        };
        sqlx::query(
            r#"
            UPDATE step_runs
            SET status = $2,
                started_at = COALESCE(started_at, $3),
                completed_at = COALESCE($4, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.to_string())
        .bind(started)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert-or-fetch by execution key. The bool is true when this call
    /// created the row.
    pub async fn create_execution(
        &self,
        step_run_id: ResourceId,
        key: &ExecutionKey,
        step_id: &str,
    ) -> DbResult<(StepExecutionRecord, bool)> {
        let inserted = sqlx::query_as::<_, StepExecutionRecord>(
            r#"
            INSERT INTO step_executions
                (id, step_run_id, pipeline_run_id, step_id, execution_key, attempt)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (execution_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(step_run_id.as_uuid())
        .bind(key.pipeline_run_id.as_uuid())
        .bind(step_id)
        .bind(key.to_string())
        .bind(key.attempt as i32)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(record) => Ok((record, true)),
            None => {
                let existing = self
                    .get_by_key(key)
                    .await?
                    .ok_or_else(|| DbError::NotFound(format!("execution {key}")))?;
                Ok((existing, false))
            }
        }
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<StepExecutionRecord> {
        sqlx::query_as::<_, StepExecutionRecord>("SELECT * FROM step_executions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("step execution {id}")))
    }

    pub async fn get_by_key(&self, key: &ExecutionKey) -> DbResult<Option<StepExecutionRecord>> {
        let record = sqlx::query_as::<_, StepExecutionRecord>(
            "SELECT * FROM step_executions WHERE execution_key = $1",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Guarded state transition; false means the row was not in any `from`
    /// state. This is what makes a zombie runner's late "completed" a no-op.
    pub async fn transition(
        &self,
        id: ResourceId,
        from: &[StepState],
        to: StepState,
        exit_code: Option<i32>,
        failure_reason: Option<&str>,
    ) -> DbResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let started = matches!(to, StepState::Running).then(Utc::now);
        let completed = to.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = $2,
                exit_code = COALESCE($3, exit_code),
                failure_reason = COALESCE($4, failure_reason),
                started_at = COALESCE(started_at, $5),
                completed_at = COALESCE($6, completed_at)
            WHERE id = $1 AND status = ANY($7)
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.to_string())
        .bind(exit_code)
        .bind(failure_reason)
        .bind(started)
        .bind(completed)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Row-lock claim for the local executor: pending → preparing, exactly
    /// one caller wins.
    pub async fn claim_pending(&self, id: ResourceId) -> DbResult<bool> {
        self.transition(id, &[StepState::Pending], StepState::Preparing, None, None)
            .await
    }

    /// Reset an abandoned execution for another runner. Clears the runner
    /// assignment; the attempt and key stay.
    pub async fn requeue(&self, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'pending', runner_id = NULL, container_id = NULL
            WHERE id = $1 AND status IN ('assigned', 'preparing', 'running')
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_runner(&self, id: ResourceId, runner_id: Option<ResourceId>) -> DbResult<()> {
        sqlx::query("UPDATE step_executions SET runner_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(runner_id.map(|r| *r.as_uuid()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_container(&self, id: ResourceId, container_id: &str) -> DbResult<()> {
        sqlx::query("UPDATE step_executions SET container_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_token_digest(&self, id: ResourceId, digest: &str) -> DbResult<()> {
        sqlx::query("UPDATE step_executions SET step_token_digest = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(digest)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn for_run(&self, pipeline_run_id: ResourceId) -> DbResult<Vec<StepExecutionRecord>> {
        let records = sqlx::query_as::<_, StepExecutionRecord>(
            "SELECT * FROM step_executions WHERE pipeline_run_id = $1 ORDER BY created_at",
        )
        .bind(pipeline_run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Executions in `preparing`/`running` with a container id, for the
    /// restart recovery sweep.
    pub async fn recoverable(&self) -> DbResult<Vec<StepExecutionRecord>> {
        let records = sqlx::query_as::<_, StepExecutionRecord>(
            "SELECT * FROM step_executions WHERE status IN ('preparing', 'running')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
