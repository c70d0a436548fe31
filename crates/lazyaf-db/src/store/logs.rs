//! Step log store. Lines arrive at-least-once with monotonic sequence
//! numbers; the composite primary key dedups redelivery.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepLogRecord {
    pub step_execution_id: uuid::Uuid,
    pub seq: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LogStore {
    pool: PgPool,
}

impl LogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a batch. Duplicate (execution, seq) pairs are silently
    /// dropped, which is the reconciliation rule for redelivery.
    pub async fn append(
        &self,
        step_execution_id: ResourceId,
        lines: &[(i64, String)],
    ) -> DbResult<u64> {
        if lines.is_empty() {
            return Ok(0);
        }
        let seqs: Vec<i64> = lines.iter().map(|(seq, _)| *seq).collect();
        let contents: Vec<String> = lines.iter().map(|(_, content)| content.clone()).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO step_logs (step_execution_id, seq, content)
            SELECT $1, seq, content FROM UNNEST($2::BIGINT[], $3::TEXT[]) AS t(seq, content)
            ON CONFLICT (step_execution_id, seq) DO NOTHING
            "#,
        )
        .bind(step_execution_id.as_uuid())
        .bind(&seqs)
        .bind(&contents)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn for_execution(
        &self,
        step_execution_id: ResourceId,
    ) -> DbResult<Vec<StepLogRecord>> {
        let records = sqlx::query_as::<_, StepLogRecord>(
            "SELECT * FROM step_logs WHERE step_execution_id = $1 ORDER BY seq",
        )
        .bind(step_execution_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Last `n` lines, in emission order. Failed cards show this tail.
    pub async fn tail(&self, step_execution_id: ResourceId, n: i64) -> DbResult<Vec<StepLogRecord>> {
        let mut records = sqlx::query_as::<_, StepLogRecord>(
            "SELECT * FROM step_logs WHERE step_execution_id = $1 ORDER BY seq DESC LIMIT $2",
        )
        .bind(step_execution_id.as_uuid())
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        records.reverse();
        Ok(records)
    }

    /// Highest sequence number seen, for resuming after reattach.
    pub async fn max_seq(&self, step_execution_id: ResourceId) -> DbResult<Option<i64>> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT MAX(seq) FROM step_logs WHERE step_execution_id = $1")
                .bind(step_execution_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(max,)| max))
    }
}
