//! Job Repository
//!
//! Handles all database operations related to background jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::job::{Job, JobSchedule, JobState};
use sqlx::PgPool;

use super::{JobRepository, RepoError, RepoResult};

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert_if_absent(&self, job: &Job) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO background_jobs (
                id, kind, payload, state, schedule, run_at, attempts, max_attempts,
                last_error, result, lease_holder, lease_expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(serde_json::to_value(&job.schedule)?)
        .bind(job.run_at)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(&job.lease_holder)
        .bind(job.lease_expires_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, kind, payload, state, schedule, run_at, attempts, max_attempts,
                   last_error, result, lease_holder, lease_expires_at, created_at, updated_at
            FROM background_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        limit: u32,
    ) -> RepoResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE background_jobs
            SET state = 'running', lease_holder = $2, lease_expires_at = $3, updated_at = $1
            WHERE id IN (
                SELECT id FROM background_jobs
                WHERE (state = 'scheduled' AND run_at <= $1)
                   OR (state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= $1))
                ORDER BY run_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, payload, state, schedule, run_at, attempts, max_attempts,
                      last_error, result, lease_holder, lease_expires_at, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(holder)
        .bind(lease_expires_at)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET lease_expires_at = $1
            WHERE id = $2 AND state = 'running'
              AND lease_holder = $3 AND lease_expires_at > $4
            "#,
        )
        .bind(lease_expires_at)
        .bind(id)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn store_result(&self, job: &Job, holder: &str) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET state = $1, run_at = $2, attempts = $3, last_error = $4, result = $5,
                lease_holder = $6, lease_expires_at = $7, updated_at = $8
            WHERE id = $9 AND lease_holder = $10
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.run_at)
        .bind(job.attempts as i32)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(&job.lease_holder)
        .bind(job.lease_expires_at)
        .bind(job.updated_at)
        .bind(&job.id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_state(&self, state: JobState, limit: u32) -> RepoResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, kind, payload, state, schedule, run_at, attempts, max_attempts,
                   last_error, result, lease_holder, lease_expires_at, created_at, updated_at
            FROM background_jobs
            WHERE state = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    payload: serde_json::Value,
    state: String,
    schedule: serde_json::Value,
    run_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    lease_holder: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::parse(&row.state)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown job state {}", row.state)))?;
        let schedule: JobSchedule = serde_json::from_value(row.schedule)?;

        Ok(Job {
            id: row.id,
            kind: row.kind,
            payload: row.payload,
            state,
            schedule,
            run_at: row.run_at,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            last_error: row.last_error,
            result: row.result,
            lease_holder: row.lease_holder,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
