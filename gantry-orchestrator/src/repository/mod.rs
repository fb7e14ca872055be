//! Repository Module
//!
//! Data access layer for the orchestrator. Each trait covers one entity group
//! and is implemented once per backend:
//! - [`memory`]: process-local maps, used by tests and single-node development
//! - PostgreSQL: the `Pg*Repository` types in the sibling modules
//!
//! The orchestration core only ever sees the traits.

pub mod check;
pub mod event;
pub mod execution;
pub mod job;
pub mod lease;
pub mod memory;
pub mod pipeline;
pub mod runner;
pub mod trigger;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::check::Check;
use gantry_core::domain::event::{Event, EventPosition};
use gantry_core::domain::execution::{
    Execution, ExecutionStatus, Stage, StageStatus, Step, StepStatus,
};
use gantry_core::domain::job::{Job, JobState};
use gantry_core::domain::log::LogLine;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::runner::Runner;
use gantry_core::domain::trigger::Trigger;
use gantry_core::domain::webhook::{Webhook, WebhookDelivery, WebhookScope};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Repository error type
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),

    /// Unique key or conditional write violated
    #[error("{0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value could not be decoded: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Corrupt(err.to_string())
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Fails with `Conflict` when the uid is taken within the repository
    async fn create(&self, pipeline: &Pipeline) -> RepoResult<()>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Pipeline>>;
    async fn list_by_repo(&self, repo_id: &str) -> RepoResult<Vec<Pipeline>>;
    async fn list_all(&self) -> RepoResult<Vec<Pipeline>>;
    async fn delete(&self, id: Uuid) -> RepoResult<bool>;
    /// Atomically increments and returns the pipeline's execution counter
    async fn next_sequence(&self, id: Uuid) -> RepoResult<i64>;
}

#[async_trait]
pub trait TriggerRepository: Send + Sync {
    /// Fails with `Conflict` when the uid is taken within the pipeline
    async fn create(&self, trigger: &Trigger) -> RepoResult<()>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Trigger>>;
    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> RepoResult<Vec<Trigger>>;
    async fn set_enabled(&self, id: Uuid, enabled: bool, at: DateTime<Utc>) -> RepoResult<bool>;
    async fn delete(&self, id: Uuid) -> RepoResult<bool>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Inserts an execution together with its stages and steps.
    ///
    /// Fails with `Conflict` when the pipeline already has an execution with
    /// the same number or the same idempotency key.
    async fn create(&self, execution: &Execution, stages: &[Stage], steps: &[Step])
    -> RepoResult<()>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Execution>>;
    async fn find_by_idempotency_key(
        &self,
        pipeline_id: Uuid,
        key: &str,
    ) -> RepoResult<Option<Execution>>;
    /// Newest first
    async fn list_by_pipeline(&self, pipeline_id: Uuid, limit: u32) -> RepoResult<Vec<Execution>>;
    /// Pending executions of a pipeline building `source_ref`
    async fn list_pending_for_ref(
        &self,
        pipeline_id: Uuid,
        source_ref: &str,
    ) -> RepoResult<Vec<Execution>>;
    async fn count_by_status(&self) -> RepoResult<Vec<(ExecutionStatus, u64)>>;
    /// Writes the execution only if its stored status is one of `from`
    async fn update(&self, execution: &Execution, from: &[ExecutionStatus]) -> RepoResult<bool>;

    async fn find_stage(&self, id: Uuid) -> RepoResult<Option<Stage>>;
    /// Ordered by stage number
    async fn list_stages(&self, execution_id: Uuid) -> RepoResult<Vec<Stage>>;
    /// Schedulable stages whose labels are a subset of `labels`, oldest
    /// execution first
    async fn list_pending_stages(&self, labels: &[String], limit: u32) -> RepoResult<Vec<Stage>>;
    /// Running stages whose lease ran out at `now`
    async fn list_expired_stages(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<Stage>>;
    /// Atomic compare-and-set from `pending` to `running` with a lease.
    ///
    /// Returns the claimed stage, or `None` if another caller got there first.
    async fn claim_stage(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Stage>>;
    /// Extends a lease still held by `runner_id` and not yet expired
    async fn renew_stage_lease(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;
    /// Writes the stage only if its stored status equals `from`.
    ///
    /// A stage written back as `running` keeps its stored lease, so a
    /// concurrent heartbeat is never rolled back; only `claim_stage` and
    /// `renew_stage_lease` move a running lease.
    async fn update_stage(&self, stage: &Stage, from: StageStatus) -> RepoResult<bool>;

    async fn find_step(&self, id: Uuid) -> RepoResult<Option<Step>>;
    /// Ordered by step number
    async fn list_steps(&self, stage_id: Uuid) -> RepoResult<Vec<Step>>;
    /// Writes the step only if its stored status equals `from`
    async fn update_step(&self, step: &Step, from: StepStatus) -> RepoResult<bool>;

    async fn append_logs(&self, step_id: Uuid, lines: &[LogLine]) -> RepoResult<()>;
    async fn list_logs(&self, step_id: Uuid) -> RepoResult<Vec<LogLine>>;
    /// Drops logs of executions that finished before `cutoff`
    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn create(&self, webhook: &Webhook) -> RepoResult<()>;
    async fn update(&self, webhook: &Webhook) -> RepoResult<bool>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Webhook>>;
    async fn delete(&self, id: Uuid) -> RepoResult<bool>;
    async fn list_by_scope(&self, scope: &WebhookScope) -> RepoResult<Vec<Webhook>>;
    /// Webhooks observing a repository, plus those of `pipeline_id` if given
    async fn list_targets(&self, repo_id: &str, pipeline_id: Option<Uuid>)
    -> RepoResult<Vec<Webhook>>;

    /// Delivery history is append-only
    async fn append_delivery(&self, delivery: &WebhookDelivery) -> RepoResult<()>;
    async fn find_delivery(&self, id: Uuid) -> RepoResult<Option<WebhookDelivery>>;
    /// Newest first
    async fn list_deliveries(&self, webhook_id: Uuid, limit: u32)
    -> RepoResult<Vec<WebhookDelivery>>;
    /// All attempts made for one event, oldest first
    async fn list_deliveries_for_event(
        &self,
        webhook_id: Uuid,
        event: &EventPosition,
    ) -> RepoResult<Vec<WebhookDelivery>>;
    /// Latest record of every chain with a planned attempt, oldest chain first
    async fn list_open_deliveries(&self, limit: u32) -> RepoResult<Vec<WebhookDelivery>>;
    /// Whether some chain of `webhook_id` still has a planned attempt
    async fn has_open_deliveries(&self, webhook_id: Uuid) -> RepoResult<bool>;
    async fn delete_deliveries_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts unless a job with the same id exists; returns whether it inserted
    async fn insert_if_absent(&self, job: &Job) -> RepoResult<bool>;
    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Job>>;
    /// Atomically hands due jobs to `holder`: scheduled jobs whose `run_at`
    /// passed, and running jobs whose previous holder's lease expired
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        limit: u32,
    ) -> RepoResult<Vec<Job>>;
    /// Extends the lease of a running job still held by `holder` and not
    /// yet expired
    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;
    /// Writes the job back only while `holder` still owns it
    async fn store_result(&self, job: &Job, holder: &str) -> RepoResult<bool>;
    async fn list_by_state(&self, state: JobState, limit: u32) -> RepoResult<Vec<Job>>;
}

#[async_trait]
pub trait CheckRepository: Send + Sync {
    async fn upsert(&self, check: &Check) -> RepoResult<()>;
    async fn list_for_commit(&self, repo_id: &str, commit_sha: &str) -> RepoResult<Vec<Check>>;
}

#[async_trait]
pub trait RunnerRepository: Send + Sync {
    /// Creates or refreshes a runner, keeping its first registration time
    async fn upsert(&self, runner: &Runner) -> RepoResult<()>;
    async fn list_all(&self) -> RepoResult<Vec<Runner>>;
}

#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Takes `key` if it is free or its lease expired at `now`.
    /// Returns the new fencing token on success.
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<u64>>;
    /// Extends a lease still held by `holder` and not yet expired
    async fn renew(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;
    async fn release(&self, key: &str, holder: &str) -> RepoResult<bool>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably records an event and assigns the stream's next offset
    async fn append(
        &self,
        stream: &str,
        partition_key: &str,
        payload: &[u8],
        produced_at: DateTime<Utc>,
    ) -> RepoResult<Event>;
    /// Events with an offset greater than `after`, ascending
    async fn read(&self, stream: &str, after: i64, limit: u32) -> RepoResult<Vec<Event>>;
    async fn load_checkpoint(&self, stream: &str, group: &str) -> RepoResult<Option<i64>>;
    async fn store_checkpoint(&self, stream: &str, group: &str, offset: i64) -> RepoResult<()>;
}

/// The full set of repositories one backend provides
#[derive(Clone)]
pub struct Repositories {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub triggers: Arc<dyn TriggerRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub checks: Arc<dyn CheckRepository>,
    pub runners: Arc<dyn RunnerRepository>,
    pub leases: Arc<dyn LeaseRepository>,
    pub events: Arc<dyn EventLog>,
}

impl Repositories {
    /// Process-local backend
    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::default());
        Self {
            pipelines: store.clone(),
            triggers: store.clone(),
            executions: store.clone(),
            webhooks: store.clone(),
            jobs: store.clone(),
            checks: store.clone(),
            runners: store.clone(),
            leases: store.clone(),
            events: store,
        }
    }

    /// PostgreSQL backend; the schema must already be migrated
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            pipelines: Arc::new(pipeline::PgPipelineRepository::new(pool.clone())),
            triggers: Arc::new(trigger::PgTriggerRepository::new(pool.clone())),
            executions: Arc::new(execution::PgExecutionRepository::new(pool.clone())),
            webhooks: Arc::new(webhook::PgWebhookRepository::new(pool.clone())),
            jobs: Arc::new(job::PgJobRepository::new(pool.clone())),
            checks: Arc::new(check::PgCheckRepository::new(pool.clone())),
            runners: Arc::new(runner::PgRunnerRepository::new(pool.clone())),
            leases: Arc::new(lease::PgLeaseRepository::new(pool.clone())),
            events: Arc::new(event::PgEventLog::new(pool)),
        }
    }
}

/// Maps unique-constraint violations to `Conflict`
pub(crate) fn unique_violation(err: sqlx::Error, what: impl Into<String>) -> RepoError {
    const UNIQUE_VIOLATION: &str = "23505";
    let is_unique = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if is_unique {
        RepoError::Conflict(what.into())
    } else {
        RepoError::Database(err)
    }
}
