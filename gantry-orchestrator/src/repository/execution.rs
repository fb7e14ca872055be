//! Execution Repository
//!
//! Handles all database operations related to executions, their stages,
//! steps and step logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::event::EventPosition;
use gantry_core::domain::execution::{
    Execution, ExecutionRefs, ExecutionStatus, Stage, StageLease, StageStatus, Step, StepStatus,
    TriggerCause,
};
use gantry_core::domain::log::{LogLine, LogSource};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{ExecutionRepository, RepoError, RepoResult, unique_violation};

pub struct PgExecutionRepository {
    pool: PgPool,
}

impl PgExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn create(
        &self,
        execution: &Execution,
        stages: &[Stage],
        steps: &[Step],
    ) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, pipeline_id, repo_id, number, cause, source_ref, target_ref,
                commit_sha, before_sha, status, fail_fast, params, idempotency_key,
                source_stream, source_offset, triggered_by, error,
                created_at, started_at, finished_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(execution.id)
        .bind(execution.pipeline_id)
        .bind(&execution.repo_id)
        .bind(execution.number)
        .bind(cause_to_string(execution.cause))
        .bind(&execution.refs.source_ref)
        .bind(&execution.refs.target_ref)
        .bind(&execution.refs.commit_sha)
        .bind(&execution.refs.before_sha)
        .bind(execution.status.as_str())
        .bind(execution.fail_fast)
        .bind(serde_json::to_value(&execution.params)?)
        .bind(&execution.idempotency_key)
        .bind(execution.source_event.as_ref().map(|p| p.stream.clone()))
        .bind(execution.source_event.as_ref().map(|p| p.offset))
        .bind(&execution.triggered_by)
        .bind(&execution.error)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            unique_violation(
                e,
                format!(
                    "execution #{} or key {:?} already exists",
                    execution.number, execution.idempotency_key
                ),
            )
        })?;

        for stage in stages {
            sqlx::query(
                r#"
                INSERT INTO stages (
                    id, execution_id, number, name, depends_on, labels, status,
                    lease_runner, lease_expires_at, reclaims, cancel_requested,
                    fail_fast, error, started_at, finished_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(stage.id)
            .bind(stage.execution_id)
            .bind(stage.number)
            .bind(&stage.name)
            .bind(&stage.depends_on)
            .bind(&stage.labels)
            .bind(stage.status.as_str())
            .bind(stage.lease.as_ref().map(|l| l.runner_id.clone()))
            .bind(stage.lease.as_ref().map(|l| l.expires_at))
            .bind(stage.reclaims)
            .bind(stage.cancel_requested)
            .bind(stage.fail_fast)
            .bind(&stage.error)
            .bind(stage.started_at)
            .bind(stage.finished_at)
            .bind(stage.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO steps (
                    id, stage_id, execution_id, number, name, image, commands, env,
                    secrets, status, exit_code, error, started_at, finished_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(step.id)
            .bind(step.stage_id)
            .bind(step.execution_id)
            .bind(step.number)
            .bind(&step.name)
            .bind(&step.image)
            .bind(&step.commands)
            .bind(serde_json::to_value(&step.env)?)
            .bind(&step.secrets)
            .bind(step.status.as_str())
            .bind(step.exit_code)
            .bind(&step.error)
            .bind(step.started_at)
            .bind(step.finished_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline_id, repo_id, number, cause, source_ref, target_ref,
                   commit_sha, before_sha, status, fail_fast, params, idempotency_key,
                   source_stream, source_offset, triggered_by, error,
                   created_at, started_at, finished_at, updated_at
            FROM executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Execution::try_from).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        pipeline_id: Uuid,
        key: &str,
    ) -> RepoResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline_id, repo_id, number, cause, source_ref, target_ref,
                   commit_sha, before_sha, status, fail_fast, params, idempotency_key,
                   source_stream, source_offset, triggered_by, error,
                   created_at, started_at, finished_at, updated_at
            FROM executions
            WHERE pipeline_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(pipeline_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Execution::try_from).transpose()
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid, limit: u32) -> RepoResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline_id, repo_id, number, cause, source_ref, target_ref,
                   commit_sha, before_sha, status, fail_fast, params, idempotency_key,
                   source_stream, source_offset, triggered_by, error,
                   created_at, started_at, finished_at, updated_at
            FROM executions
            WHERE pipeline_id = $1
            ORDER BY number DESC
            LIMIT $2
            "#,
        )
        .bind(pipeline_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn list_pending_for_ref(
        &self,
        pipeline_id: Uuid,
        source_ref: &str,
    ) -> RepoResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline_id, repo_id, number, cause, source_ref, target_ref,
                   commit_sha, before_sha, status, fail_fast, params, idempotency_key,
                   source_stream, source_offset, triggered_by, error,
                   created_at, started_at, finished_at, updated_at
            FROM executions
            WHERE pipeline_id = $1 AND source_ref = $2 AND status = 'pending'
            ORDER BY number ASC
            "#,
        )
        .bind(pipeline_id)
        .bind(source_ref)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn count_by_status(&self) -> RepoResult<Vec<(ExecutionStatus, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM executions GROUP BY status ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count)| Ok((parse_execution_status(&status)?, count as u64)))
            .collect()
    }

    async fn update(&self, execution: &Execution, from: &[ExecutionStatus]) -> RepoResult<bool> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $1, error = $2, started_at = $3, finished_at = $4, updated_at = $5
            WHERE id = $6 AND status = ANY($7)
            "#,
        )
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.updated_at)
        .bind(execution.id)
        .bind(&from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stage(&self, id: Uuid) -> RepoResult<Option<Stage>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, execution_id, number, name, depends_on, labels, status,
                   lease_runner, lease_expires_at, reclaims, cancel_requested,
                   fail_fast, error, started_at, finished_at, updated_at
            FROM stages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Stage::try_from).transpose()
    }

    async fn list_stages(&self, execution_id: Uuid) -> RepoResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, execution_id, number, name, depends_on, labels, status,
                   lease_runner, lease_expires_at, reclaims, cancel_requested,
                   fail_fast, error, started_at, finished_at, updated_at
            FROM stages
            WHERE execution_id = $1
            ORDER BY number ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn list_pending_stages(&self, labels: &[String], limit: u32) -> RepoResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT s.id, s.execution_id, s.number, s.name, s.depends_on, s.labels, s.status,
                   s.lease_runner, s.lease_expires_at, s.reclaims, s.cancel_requested,
                   s.fail_fast, s.error, s.started_at, s.finished_at, s.updated_at
            FROM stages s
            JOIN executions e ON e.id = s.execution_id
            WHERE s.status = 'pending'
              AND NOT s.cancel_requested
              AND s.labels <@ $1
            ORDER BY e.created_at ASC, s.execution_id, s.number ASC
            LIMIT $2
            "#,
        )
        .bind(labels)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn list_expired_stages(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, execution_id, number, name, depends_on, labels, status,
                   lease_runner, lease_expires_at, reclaims, cancel_requested,
                   fail_fast, error, started_at, finished_at, updated_at
            FROM stages
            WHERE status = 'running'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn claim_stage(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Stage>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            UPDATE stages
            SET status = 'running', lease_runner = $2, lease_expires_at = $3,
                started_at = COALESCE(started_at, $4), updated_at = $4
            WHERE id = $1 AND status = 'pending' AND NOT cancel_requested
              AND NOT EXISTS (
                  SELECT 1 FROM executions e
                  WHERE e.id = stages.execution_id AND e.status = 'canceled'
              )
            RETURNING id, execution_id, number, name, depends_on, labels, status,
                      lease_runner, lease_expires_at, reclaims, cancel_requested,
                      fail_fast, error, started_at, finished_at, updated_at
            "#,
        )
        .bind(id)
        .bind(runner_id)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Stage::try_from).transpose()
    }

    async fn renew_stage_lease(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stages
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'running'
              AND lease_runner = $2 AND lease_expires_at > $4
            "#,
        )
        .bind(id)
        .bind(runner_id)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_stage(&self, stage: &Stage, from: StageStatus) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stages
            SET status = $1, reclaims = $2, cancel_requested = $3, error = $4,
                started_at = $5, finished_at = $6, updated_at = $7,
                lease_runner = CASE WHEN $1 = 'running' THEN lease_runner ELSE $8 END,
                lease_expires_at = CASE WHEN $1 = 'running' THEN lease_expires_at ELSE $9 END
            WHERE id = $10 AND status = $11
            "#,
        )
        .bind(stage.status.as_str())
        .bind(stage.reclaims)
        .bind(stage.cancel_requested)
        .bind(&stage.error)
        .bind(stage.started_at)
        .bind(stage.finished_at)
        .bind(stage.updated_at)
        .bind(stage.lease.as_ref().map(|l| l.runner_id.clone()))
        .bind(stage.lease.as_ref().map(|l| l.expires_at))
        .bind(stage.id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_step(&self, id: Uuid) -> RepoResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, stage_id, execution_id, number, name, image, commands, env,
                   secrets, status, exit_code, error, started_at, finished_at
            FROM steps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Step::try_from).transpose()
    }

    async fn list_steps(&self, stage_id: Uuid) -> RepoResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, stage_id, execution_id, number, name, image, commands, env,
                   secrets, status, exit_code, error, started_at, finished_at
            FROM steps
            WHERE stage_id = $1
            ORDER BY number ASC
            "#,
        )
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Step::try_from).collect()
    }

    async fn update_step(&self, step: &Step, from: StepStatus) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = $1, exit_code = $2, error = $3, started_at = $4, finished_at = $5
            WHERE id = $6 AND status = $7
            "#,
        )
        .bind(step.status.as_str())
        .bind(step.exit_code)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_logs(&self, step_id: Uuid, lines: &[LogLine]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO step_logs (step_id, timestamp, source, message)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(step_id)
            .bind(line.timestamp)
            .bind(line.source.as_str())
            .bind(&line.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_logs(&self, step_id: Uuid) -> RepoResult<Vec<LogLine>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT timestamp, source, message
            FROM step_logs
            WHERE step_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM step_logs l
            USING steps s, executions e
            WHERE l.step_id = s.id
              AND s.execution_id = e.id
              AND e.finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn cause_to_string(cause: TriggerCause) -> String {
    cause.to_string()
}

fn parse_cause(s: &str) -> RepoResult<TriggerCause> {
    match s {
        "push" => Ok(TriggerCause::Push),
        "tag" => Ok(TriggerCause::Tag),
        "pull_request" => Ok(TriggerCause::PullRequest),
        "manual" => Ok(TriggerCause::Manual),
        "cron" => Ok(TriggerCause::Cron),
        other => Err(RepoError::Corrupt(format!("unknown trigger cause {}", other))),
    }
}

fn parse_execution_status(s: &str) -> RepoResult<ExecutionStatus> {
    ExecutionStatus::parse(s)
        .ok_or_else(|| RepoError::Corrupt(format!("unknown execution status {}", s)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    pipeline_id: Uuid,
    repo_id: String,
    number: i64,
    cause: String,
    source_ref: String,
    target_ref: String,
    commit_sha: String,
    before_sha: Option<String>,
    status: String,
    fail_fast: bool,
    params: serde_json::Value,
    idempotency_key: Option<String>,
    source_stream: Option<String>,
    source_offset: Option<i64>,
    triggered_by: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = RepoError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let params: HashMap<String, String> = serde_json::from_value(row.params)?;
        let source_event = match (row.source_stream, row.source_offset) {
            (Some(stream), Some(offset)) => Some(EventPosition { stream, offset }),
            _ => None,
        };

        Ok(Execution {
            id: row.id,
            pipeline_id: row.pipeline_id,
            repo_id: row.repo_id,
            number: row.number,
            cause: parse_cause(&row.cause)?,
            refs: ExecutionRefs {
                source_ref: row.source_ref,
                target_ref: row.target_ref,
                commit_sha: row.commit_sha,
                before_sha: row.before_sha,
            },
            status: parse_execution_status(&row.status)?,
            fail_fast: row.fail_fast,
            params,
            idempotency_key: row.idempotency_key,
            source_event,
            triggered_by: row.triggered_by,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: Uuid,
    execution_id: Uuid,
    number: i32,
    name: String,
    depends_on: Vec<String>,
    labels: Vec<String>,
    status: String,
    lease_runner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    reclaims: i32,
    cancel_requested: bool,
    fail_fast: bool,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StageRow> for Stage {
    type Error = RepoError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let status = StageStatus::parse(&row.status)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown stage status {}", row.status)))?;
        let lease = match (row.lease_runner, row.lease_expires_at) {
            (Some(runner_id), Some(expires_at)) => Some(StageLease {
                runner_id,
                expires_at,
            }),
            _ => None,
        };

        Ok(Stage {
            id: row.id,
            execution_id: row.execution_id,
            number: row.number,
            name: row.name,
            depends_on: row.depends_on,
            labels: row.labels,
            status,
            lease,
            reclaims: row.reclaims,
            cancel_requested: row.cancel_requested,
            fail_fast: row.fail_fast,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    stage_id: Uuid,
    execution_id: Uuid,
    number: i32,
    name: String,
    image: Option<String>,
    commands: Vec<String>,
    env: serde_json::Value,
    secrets: Vec<String>,
    status: String,
    exit_code: Option<i32>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for Step {
    type Error = RepoError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = StepStatus::parse(&row.status)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown step status {}", row.status)))?;

        Ok(Step {
            id: row.id,
            stage_id: row.stage_id,
            execution_id: row.execution_id,
            number: row.number,
            name: row.name,
            image: row.image,
            commands: row.commands,
            env: serde_json::from_value(row.env)?,
            secrets: row.secrets,
            status,
            exit_code: row.exit_code,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: DateTime<Utc>,
    source: String,
    message: String,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            timestamp: row.timestamp,
            source: LogSource::parse(&row.source),
            message: row.message,
        }
    }
}
