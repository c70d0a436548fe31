//! Workspace store. Exclusive operations take a `FOR UPDATE` row lock for
//! the duration of one transaction; shared usage is the `use_count`.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::workspace::WorkspaceState;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceRecord {
    pub id: String,
    pub pipeline_run_id: uuid::Uuid,
    pub status: String,
    pub use_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    pub fn state(&self) -> DbResult<WorkspaceState> {
        WorkspaceState::parse(&self.status).ok_or_else(|| {
            DbError::Corrupt(format!("workspace {} status {}", self.id, self.status))
        })
    }
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: PgPool,
}

impl WorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the row in `creating`, or return the existing one. The bool
    /// is true when this call created it and therefore owns materialization.
    pub async fn get_or_insert(
        &self,
        id: &str,
        pipeline_run_id: ResourceId,
    ) -> DbResult<(WorkspaceRecord, bool)> {
        let inserted = sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            INSERT INTO workspaces (id, pipeline_run_id)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(pipeline_run_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(record) => Ok((record, true)),
            None => Ok((self.get(id).await?, false)),
        }
    }

    pub async fn get(&self, id: &str) -> DbResult<WorkspaceRecord> {
        sqlx::query_as::<_, WorkspaceRecord>("SELECT * FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workspace {id}")))
    }

    /// Guarded state transition.
    pub async fn transition(
        &self,
        id: &str,
        from: &[WorkspaceState],
        to: WorkspaceState,
    ) -> DbResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            "UPDATE workspaces SET status = $2, last_used_at = NOW()
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.to_string())
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Shared acquisition: bumps `use_count` and moves a `ready` workspace
    /// to `in_use`. Refused unless the workspace is ready or already in use.
    pub async fn acquire_shared(&self, id: &str) -> DbResult<WorkspaceRecord> {
        sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            UPDATE workspaces
            SET use_count = use_count + 1, status = 'in_use', last_used_at = NOW()
            WHERE id = $1 AND status IN ('ready', 'in_use')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::Conflict(format!("workspace {id} is not ready")))
    }

    /// Shared release. When the count drops to zero the workspace returns
    /// to `ready`.
    pub async fn release_shared(&self, id: &str) -> DbResult<WorkspaceRecord> {
        sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            UPDATE workspaces
            SET use_count = GREATEST(use_count - 1, 0),
                status = CASE WHEN use_count <= 1 THEN 'ready' ELSE 'in_use' END,
                last_used_at = NOW()
            WHERE id = $1 AND status = 'in_use'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::Conflict(format!("workspace {id} is not in use")))
    }

    /// Exclusive claim for cleanup: takes the row lock, refuses while
    /// `use_count > 0`, and moves to `cleaning`.
    pub async fn begin_cleanup(&self, id: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT * FROM workspaces WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(false);
        };
        let state = record.state()?;
        let cleanable = matches!(
            state,
            WorkspaceState::Ready | WorkspaceState::Failed | WorkspaceState::Orphaned
        );
        if record.use_count > 0 || !cleanable {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE workspaces SET status = 'cleaning' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn mark_destroyed(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE workspaces SET status = 'destroyed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Quiescent workspaces of terminal runs, idle longer than the grace
    /// window. Audit candidates.
    pub async fn audit_candidates(&self, grace_secs: i64) -> DbResult<Vec<WorkspaceRecord>> {
        let records = sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            SELECT w.* FROM workspaces w
            JOIN pipeline_runs r ON r.id = w.pipeline_run_id
            WHERE w.use_count = 0
              AND w.status IN ('ready', 'failed', 'orphaned')
              AND r.status IN ('completed', 'failed', 'cancelled')
              AND w.last_used_at < NOW() - ($1 * INTERVAL '1 second')
            "#,
        )
        .bind(grace_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn all_live(&self) -> DbResult<Vec<WorkspaceRecord>> {
        let records = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT * FROM workspaces WHERE status NOT IN ('destroyed')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
