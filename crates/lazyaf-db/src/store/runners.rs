//! Runner store. Rows survive disconnection so reconnect recovery can find
//! abandoned work.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::runner::{Labels, RunnerState};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerRecord {
    pub id: uuid::Uuid,
    pub name: Option<String>,
    pub runner_type: String,
    pub labels: serde_json::Value,
    pub status: String,
    pub current_step_execution_id: Option<uuid::Uuid>,
    pub websocket_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl RunnerRecord {
    pub fn state(&self) -> DbResult<RunnerState> {
        RunnerState::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("runner {} status {}", self.id, self.status)))
    }

    pub fn label_set(&self) -> DbResult<Labels> {
        serde_json::from_value(self.labels.clone())
            .map_err(|e| DbError::Corrupt(format!("runner {} labels: {e}", self.id)))
    }
}

#[derive(Clone)]
pub struct RunnerStore {
    pool: PgPool,
}

impl RunnerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert on register. Reconnecting runners come back `idle`; their
    /// previous assignment (if any) was requeued by the death watchdog.
    pub async fn register(
        &self,
        id: ResourceId,
        name: Option<&str>,
        runner_type: &str,
        labels: &Labels,
        websocket_id: &str,
    ) -> DbResult<RunnerRecord> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            INSERT INTO runners
                (id, name, runner_type, labels, status, websocket_id, connected_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, 'idle', $5, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                runner_type = EXCLUDED.runner_type,
                labels = EXCLUDED.labels,
                status = 'idle',
                current_step_execution_id = NULL,
                websocket_id = EXCLUDED.websocket_id,
                connected_at = NOW(),
                last_heartbeat = NOW()
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(name)
        .bind(runner_type)
        .bind(serde_json::to_value(labels).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .bind(websocket_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<RunnerRecord> {
        sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("runner {id}")))
    }

    pub async fn list(&self) -> DbResult<Vec<RunnerRecord>> {
        let records = sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    pub async fn idle(&self) -> DbResult<Vec<RunnerRecord>> {
        let records =
            sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners WHERE status = 'idle'")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    /// Assign a step to an idle runner; exactly one caller wins the row.
    pub async fn assign(
        &self,
        id: ResourceId,
        step_execution_id: ResourceId,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET status = 'assigned', current_step_execution_id = $2
            WHERE id = $1 AND status = 'idle'
            "#,
        )
        .bind(id.as_uuid())
        .bind(step_execution_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn transition(
        &self,
        id: ResourceId,
        from: &[RunnerState],
        to: RunnerState,
    ) -> DbResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let clear = !to.is_working();
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET status = $2,
                current_step_execution_id =
                    CASE WHEN $3 THEN NULL ELSE current_step_execution_id END
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.to_string())
        .bind(clear)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn heartbeat(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE runners SET last_heartbeat = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_disconnected(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE runners SET status = 'disconnected', websocket_id = NULL
            WHERE id = $1 AND status NOT IN ('dead')
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Working runners whose heartbeat expired. The watchdog marks them
    /// dead and requeues their step.
    pub async fn expire_dead(&self, death_timeout_secs: i64) -> DbResult<Vec<RunnerRecord>> {
        let records = sqlx::query_as::<_, RunnerRecord>(
            r#"
            UPDATE runners
            SET status = 'dead'
            WHERE status IN ('assigned', 'busy')
              AND last_heartbeat < NOW() - ($1 * INTERVAL '1 second')
            RETURNING *
            "#,
        )
        .bind(death_timeout_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
