//! Pipeline Repository
//!
//! Handles all database operations related to pipelines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::pipeline::Pipeline;
use sqlx::PgPool;
use uuid::Uuid;

use super::{PipelineRepository, RepoError, RepoResult, unique_violation};

pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn create(&self, pipeline: &Pipeline) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (
                id, repo_id, uid, description, config_path, default_branch,
                seq, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(pipeline.id)
        .bind(&pipeline.repo_id)
        .bind(&pipeline.uid)
        .bind(&pipeline.description)
        .bind(&pipeline.config_path)
        .bind(&pipeline.default_branch)
        .bind(pipeline.seq)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation(
                e,
                format!(
                    "pipeline {} already exists in {}",
                    pipeline.uid, pipeline.repo_id
                ),
            )
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, repo_id, uid, description, config_path, default_branch,
                   seq, created_at, updated_at
            FROM pipelines
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_by_repo(&self, repo_id: &str) -> RepoResult<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, repo_id, uid, description, config_path, default_branch,
                   seq, created_at, updated_at
            FROM pipelines
            WHERE repo_id = $1
            ORDER BY uid ASC
            "#,
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn list_all(&self) -> RepoResult<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, repo_id, uid, description, config_path, default_branch,
                   seq, created_at, updated_at
            FROM pipelines
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn next_sequence(&self, id: Uuid) -> RepoResult<i64> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE pipelines
            SET seq = seq + 1
            WHERE id = $1
            RETURNING seq
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        seq.ok_or_else(|| RepoError::NotFound(format!("pipeline {}", id)))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    repo_id: String,
    uid: String,
    description: Option<String>,
    config_path: String,
    default_branch: String,
    seq: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: row.id,
            repo_id: row.repo_id,
            uid: row.uid,
            description: row.description,
            config_path: row.config_path,
            default_branch: row.default_branch,
            seq: row.seq,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
