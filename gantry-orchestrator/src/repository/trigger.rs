//! Trigger Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::trigger::{Trigger, TriggerAction};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepoError, RepoResult, TriggerRepository, unique_violation};

pub struct PgTriggerRepository {
    pool: PgPool,
}

impl PgTriggerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerRepository for PgTriggerRepository {
    async fn create(&self, trigger: &Trigger) -> RepoResult<()> {
        let actions: Vec<&str> = trigger.actions.iter().map(|a| a.as_str()).collect();

        sqlx::query(
            r#"
            INSERT INTO triggers (
                id, pipeline_id, uid, description, actions, ref_patterns,
                path_patterns, enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(trigger.id)
        .bind(trigger.pipeline_id)
        .bind(&trigger.uid)
        .bind(&trigger.description)
        .bind(&actions)
        .bind(&trigger.ref_patterns)
        .bind(&trigger.path_patterns)
        .bind(trigger.enabled)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("trigger {} already exists", trigger.uid)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Trigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, pipeline_id, uid, description, actions, ref_patterns,
                   path_patterns, enabled, created_at, updated_at
            FROM triggers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Trigger::try_from).transpose()
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> RepoResult<Vec<Trigger>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, pipeline_id, uid, description, actions, ref_patterns,
                   path_patterns, enabled, created_at, updated_at
            FROM triggers
            WHERE pipeline_id = $1
            ORDER BY uid ASC
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trigger::try_from).collect()
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool, at: DateTime<Utc>) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE triggers SET enabled = $1, updated_at = $2 WHERE id = $3")
            .bind(enabled)
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    pipeline_id: Uuid,
    uid: String,
    description: Option<String>,
    actions: Vec<String>,
    ref_patterns: Vec<String>,
    path_patterns: Vec<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = RepoError;

    fn try_from(row: TriggerRow) -> Result<Self, Self::Error> {
        let actions = row
            .actions
            .iter()
            .map(|a| {
                TriggerAction::parse(a)
                    .ok_or_else(|| RepoError::Corrupt(format!("unknown trigger action {}", a)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Trigger {
            id: row.id,
            pipeline_id: row.pipeline_id,
            uid: row.uid,
            description: row.description,
            actions,
            ref_patterns: row.ref_patterns,
            path_patterns: row.path_patterns,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
