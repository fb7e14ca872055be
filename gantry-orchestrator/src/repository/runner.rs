//! Runner Repository
//!
//! Handles all database operations related to runners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::runner::Runner;
use sqlx::PgPool;

use super::{RepoResult, RunnerRepository};

pub struct PgRunnerRepository {
    pool: PgPool,
}

impl PgRunnerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunnerRepository for PgRunnerRepository {
    async fn upsert(&self, runner: &Runner) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (id, labels, registered_at, last_seen_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                labels = EXCLUDED.labels,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(&runner.id)
        .bind(&runner.labels)
        .bind(runner.registered_at)
        .bind(runner.last_seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_all(&self) -> RepoResult<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            r#"
            SELECT id, labels, registered_at, last_seen_at
            FROM runners
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: String,
    labels: Vec<String>,
    registered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        Runner {
            id: row.id,
            labels: row.labels,
            registered_at: row.registered_at,
            last_seen_at: row.last_seen_at,
        }
    }
}
