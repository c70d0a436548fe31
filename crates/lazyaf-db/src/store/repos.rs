//! Repo store.

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RepoRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub default_branch: String,
    pub remote_url: Option<String>,
    pub is_ingested: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RepoStore {
    pool: PgPool,
}

impl RepoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        default_branch: &str,
        remote_url: Option<&str>,
    ) -> DbResult<RepoRecord> {
        let record = sqlx::query_as::<_, RepoRecord>(
            r#"
            INSERT INTO repos (id, name, default_branch, remote_url)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .bind(default_branch)
        .bind(remote_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<RepoRecord> {
        sqlx::query_as::<_, RepoRecord>("SELECT * FROM repos WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("repo {id}")))
    }

    pub async fn get_by_name(&self, name: &str) -> DbResult<Option<RepoRecord>> {
        let record = sqlx::query_as::<_, RepoRecord>("SELECT * FROM repos WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn list(&self) -> DbResult<Vec<RepoRecord>> {
        let records = sqlx::query_as::<_, RepoRecord>("SELECT * FROM repos ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    pub async fn mark_ingested(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE repos SET is_ingested = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM repos WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
