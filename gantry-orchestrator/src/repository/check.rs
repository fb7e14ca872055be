//! Commit Check Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::check::{Check, CheckStatus};
use sqlx::PgPool;

use super::{CheckRepository, RepoError, RepoResult};

pub struct PgCheckRepository {
    pool: PgPool,
}

impl PgCheckRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckRepository for PgCheckRepository {
    async fn upsert(&self, check: &Check) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checks (repo_id, commit_sha, uid, status, summary, link, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (repo_id, commit_sha, uid) DO UPDATE SET
                status = EXCLUDED.status,
                summary = EXCLUDED.summary,
                link = EXCLUDED.link,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&check.repo_id)
        .bind(&check.commit_sha)
        .bind(&check.uid)
        .bind(check.status.as_str())
        .bind(&check.summary)
        .bind(&check.link)
        .bind(check.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_commit(&self, repo_id: &str, commit_sha: &str) -> RepoResult<Vec<Check>> {
        let rows = sqlx::query_as::<_, CheckRow>(
            r#"
            SELECT repo_id, commit_sha, uid, status, summary, link, updated_at
            FROM checks
            WHERE repo_id = $1 AND commit_sha = $2
            ORDER BY uid ASC
            "#,
        )
        .bind(repo_id)
        .bind(commit_sha)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Check::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct CheckRow {
    repo_id: String,
    commit_sha: String,
    uid: String,
    status: String,
    summary: String,
    link: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CheckRow> for Check {
    type Error = RepoError;

    fn try_from(row: CheckRow) -> Result<Self, Self::Error> {
        let status = CheckStatus::parse(&row.status)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown check status {}", row.status)))?;

        Ok(Check {
            repo_id: row.repo_id,
            commit_sha: row.commit_sha,
            uid: row.uid,
            status,
            summary: row.summary,
            link: row.link,
            updated_at: row.updated_at,
        })
    }
}
