//! Job store: the standalone-card path, a degenerate pipeline run.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::card::JobStatus;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub card_id: uuid::Uuid,
    pub pipeline_run_id: Option<uuid::Uuid>,
    pub status: String,
    pub test_pass_count: i32,
    pub test_fail_count: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn job_status(&self) -> DbResult<JobStatus> {
        JobStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("job {} status {}", self.id, self.status)))
    }
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        card_id: ResourceId,
        pipeline_run_id: ResourceId,
    ) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, card_id, pipeline_run_id)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(card_id.as_uuid())
        .bind(pipeline_run_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    pub async fn set_status(&self, id: ResourceId, status: JobStatus) -> DbResult<()> {
        let completed_at = status.is_terminal().then(Utc::now);
        sqlx::query(
            "UPDATE jobs SET status = $2, completed_at = COALESCE($3, completed_at) WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.to_string())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn for_run(&self, pipeline_run_id: ResourceId) -> DbResult<Option<JobRecord>> {
        let record =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE pipeline_run_id = $1")
                .bind(pipeline_run_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }
}
