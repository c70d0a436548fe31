//! Card store. Status transitions come from the executor (standalone jobs)
//! or from pipeline trigger actions.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::card::CardStatus;
use lazyaf_core::step::{StepConfig, StepKind};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CardRecord {
    pub id: uuid::Uuid,
    pub repo_id: uuid::Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub branch_name: Option<String>,
    pub step_type: String,
    pub step_config: serde_json::Value,
    pub job_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CardRecord {
    pub fn card_status(&self) -> DbResult<CardStatus> {
        CardStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("card {} status {}", self.id, self.status)))
    }

    pub fn config(&self) -> DbResult<StepConfig> {
        serde_json::from_value(self.step_config.clone())
            .map_err(|e| DbError::Corrupt(format!("card {} step_config: {e}", self.id)))
    }
}

#[derive(Clone)]
pub struct CardStore {
    pool: PgPool,
}

impl CardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        repo_id: ResourceId,
        title: &str,
        description: &str,
        kind: StepKind,
        config: &StepConfig,
    ) -> DbResult<CardRecord> {
        let record = sqlx::query_as::<_, CardRecord>(
            r#"
            INSERT INTO cards (id, repo_id, title, description, step_type, step_config)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(repo_id.as_uuid())
        .bind(title)
        .bind(description)
        .bind(kind.to_string())
        .bind(serde_json::to_value(config).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<CardRecord> {
        sqlx::query_as::<_, CardRecord>("SELECT * FROM cards WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("card {id}")))
    }

    pub async fn list_by_repo(&self, repo_id: ResourceId) -> DbResult<Vec<CardRecord>> {
        let records = sqlx::query_as::<_, CardRecord>(
            "SELECT * FROM cards WHERE repo_id = $1 ORDER BY created_at",
        )
        .bind(repo_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_status(&self, id: ResourceId, status: CardStatus) -> DbResult<()> {
        sqlx::query("UPDATE cards SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Assign the working branch at first start; retries reuse it.
    pub async fn ensure_branch(&self, id: ResourceId) -> DbResult<String> {
        let card = self.get(id).await?;
        if let Some(branch) = card.branch_name {
            return Ok(branch);
        }
        let branch = format!("lazyaf/card-{}", id.short());
        sqlx::query(
            "UPDATE cards SET branch_name = $2, updated_at = NOW()
             WHERE id = $1 AND branch_name IS NULL",
        )
        .bind(id.as_uuid())
        .bind(&branch)
        .execute(&self.pool)
        .await?;
        // A concurrent starter may have raced us; read back the winner.
        let card = self.get(id).await?;
        card.branch_name
            .ok_or_else(|| DbError::Corrupt(format!("card {id} lost its branch")))
    }

    pub async fn set_job(&self, id: ResourceId, job_id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE cards SET job_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM cards WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
