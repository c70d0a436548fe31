//! Trigger dedup store. The unique constraint on `trigger_key` plus the
//! periodic GC implements the rolling dedup window.

use lazyaf_core::ResourceId;
use sqlx::PgPool;

use crate::DbResult;

#[derive(Clone)]
pub struct TriggerStore {
    pool: PgPool,
}

impl TriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a trigger key. Returns false when the key was already seen
    /// within the window (the event must be dropped).
    pub async fn try_record(
        &self,
        trigger_key: &str,
        trigger_type: &str,
        pipeline_run_id: Option<ResourceId>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trigger_events (id, trigger_key, trigger_type, pipeline_run_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (trigger_key) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(trigger_key)
        .bind(trigger_type)
        .bind(pipeline_run_id.map(|r| *r.as_uuid()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop keys older than the window so they may fire again.
    pub async fn gc(&self, window_secs: i64) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM trigger_events WHERE seen_at < NOW() - ($1 * INTERVAL '1 second')",
        )
        .bind(window_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
