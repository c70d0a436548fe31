//! Pipeline definition store (platform-side definitions).

use chrono::{DateTime, Utc};
use lazyaf_core::ResourceId;
use lazyaf_core::pipeline::StepsGraph;
use lazyaf_core::trigger::TriggerSpec;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRecord {
    pub id: uuid::Uuid,
    pub repo_id: uuid::Uuid,
    pub name: String,
    pub steps_graph: serde_json::Value,
    pub triggers: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn graph(&self) -> DbResult<StepsGraph> {
        serde_json::from_value(self.steps_graph.clone())
            .map_err(|e| DbError::Corrupt(format!("pipeline {} graph: {e}", self.id)))
    }

    pub fn trigger_specs(&self) -> DbResult<Vec<TriggerSpec>> {
        serde_json::from_value(self.triggers.clone())
            .map_err(|e| DbError::Corrupt(format!("pipeline {} triggers: {e}", self.id)))
    }
}

#[derive(Clone)]
pub struct PipelineStore {
    pool: PgPool,
}

impl PipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        repo_id: ResourceId,
        name: &str,
        graph: &StepsGraph,
        triggers: &[TriggerSpec],
    ) -> DbResult<PipelineRecord> {
        let record = sqlx::query_as::<_, PipelineRecord>(
            r#"
            INSERT INTO pipelines (id, repo_id, name, steps_graph, triggers)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(repo_id.as_uuid())
        .bind(name)
        .bind(serde_json::to_value(graph).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .bind(serde_json::to_value(triggers).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<PipelineRecord> {
        sqlx::query_as::<_, PipelineRecord>("SELECT * FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {id}")))
    }

    pub async fn get_by_name(
        &self,
        repo_id: ResourceId,
        name: &str,
    ) -> DbResult<Option<PipelineRecord>> {
        let record = sqlx::query_as::<_, PipelineRecord>(
            "SELECT * FROM pipelines WHERE repo_id = $1 AND name = $2",
        )
        .bind(repo_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_by_repo(&self, repo_id: ResourceId) -> DbResult<Vec<PipelineRecord>> {
        let records = sqlx::query_as::<_, PipelineRecord>(
            "SELECT * FROM pipelines WHERE repo_id = $1 ORDER BY name",
        )
        .bind(repo_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn update(
        &self,
        id: ResourceId,
        graph: &StepsGraph,
        triggers: &[TriggerSpec],
    ) -> DbResult<PipelineRecord> {
        sqlx::query_as::<_, PipelineRecord>(
            r#"
            UPDATE pipelines SET steps_graph = $2, triggers = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(graph).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .bind(serde_json::to_value(triggers).map_err(|e| DbError::Corrupt(e.to_string()))?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {id}")))
    }

    pub async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
