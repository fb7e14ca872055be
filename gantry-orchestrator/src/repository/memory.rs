//! In-memory backend
//!
//! Implements every repository trait over a single mutex-guarded state, which
//! makes each trait method atomic with respect to the others. Used by tests and
//! by `--store memory` for single-node development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::check::Check;
use gantry_core::domain::event::{Event, EventPosition};
use gantry_core::domain::execution::{
    Execution, ExecutionStatus, Stage, StageLease, StageStatus, Step, StepStatus,
};
use gantry_core::domain::job::{Job, JobState};
use gantry_core::domain::log::LogLine;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::runner::{Runner, labels_satisfy};
use gantry_core::domain::trigger::Trigger;
use gantry_core::domain::webhook::{Webhook, WebhookDelivery, WebhookScope};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    CheckRepository, EventLog, ExecutionRepository, JobRepository, LeaseRepository,
    PipelineRepository, RepoError, RepoResult, RunnerRepository, TriggerRepository,
    WebhookRepository,
};

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pipelines: HashMap<Uuid, Pipeline>,
    triggers: HashMap<Uuid, Trigger>,
    executions: HashMap<Uuid, Execution>,
    stages: HashMap<Uuid, Stage>,
    steps: HashMap<Uuid, Step>,
    logs: HashMap<Uuid, Vec<LogLine>>,
    webhooks: HashMap<Uuid, Webhook>,
    deliveries: Vec<WebhookDelivery>,
    jobs: HashMap<String, Job>,
    checks: HashMap<(String, String, String), Check>,
    runners: HashMap<String, Runner>,
    leases: HashMap<String, LeaseRecord>,
    streams: HashMap<String, Vec<Event>>,
    checkpoints: HashMap<(String, String), i64>,
}

/// Released leases keep their record so fencing tokens never go backwards
struct LeaseRecord {
    holder: Option<String>,
    expires_at: DateTime<Utc>,
    token: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Pipelines and triggers
// =============================================================================

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn create(&self, pipeline: &Pipeline) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        let taken = state
            .pipelines
            .values()
            .any(|p| p.repo_id == pipeline.repo_id && p.uid == pipeline.uid);
        if taken {
            return Err(RepoError::Conflict(format!(
                "pipeline {} already exists in {}",
                pipeline.uid, pipeline.repo_id
            )));
        }
        state.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Pipeline>> {
        Ok(self.state.lock().unwrap().pipelines.get(&id).cloned())
    }

    async fn list_by_repo(&self, repo_id: &str) -> RepoResult<Vec<Pipeline>> {
        let state = self.state.lock().unwrap();
        let mut pipelines: Vec<Pipeline> = state
            .pipelines
            .values()
            .filter(|p| p.repo_id == repo_id)
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(pipelines)
    }

    async fn list_all(&self) -> RepoResult<Vec<Pipeline>> {
        let state = self.state.lock().unwrap();
        let mut pipelines: Vec<Pipeline> = state.pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pipelines)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        let removed = state.pipelines.remove(&id).is_some();
        if removed {
            state.triggers.retain(|_, t| t.pipeline_id != id);
        }
        Ok(removed)
    }

    async fn next_sequence(&self, id: Uuid) -> RepoResult<i64> {
        let mut state = self.state.lock().unwrap();
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("pipeline {}", id)))?;
        pipeline.seq += 1;
        Ok(pipeline.seq)
    }
}

#[async_trait]
impl TriggerRepository for MemoryStore {
    async fn create(&self, trigger: &Trigger) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        let taken = state
            .triggers
            .values()
            .any(|t| t.pipeline_id == trigger.pipeline_id && t.uid == trigger.uid);
        if taken {
            return Err(RepoError::Conflict(format!(
                "trigger {} already exists",
                trigger.uid
            )));
        }
        state.triggers.insert(trigger.id, trigger.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Trigger>> {
        Ok(self.state.lock().unwrap().triggers.get(&id).cloned())
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid) -> RepoResult<Vec<Trigger>> {
        let state = self.state.lock().unwrap();
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| t.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(triggers)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool, at: DateTime<Utc>) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.triggers.get_mut(&id) {
            Some(trigger) => {
                trigger.enabled = enabled;
                trigger.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        Ok(self.state.lock().unwrap().triggers.remove(&id).is_some())
    }
}

// =============================================================================
// Executions, stages, steps and logs
// =============================================================================

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create(
        &self,
        execution: &Execution,
        stages: &[Stage],
        steps: &[Step],
    ) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        for existing in state
            .executions
            .values()
            .filter(|e| e.pipeline_id == execution.pipeline_id)
        {
            if existing.number == execution.number {
                return Err(RepoError::Conflict(format!(
                    "execution number {} already used",
                    execution.number
                )));
            }
            if execution.idempotency_key.is_some()
                && existing.idempotency_key == execution.idempotency_key
            {
                return Err(RepoError::Conflict(format!(
                    "idempotency key {} already used",
                    execution.idempotency_key.as_deref().unwrap_or_default()
                )));
            }
        }

        state.executions.insert(execution.id, execution.clone());
        for stage in stages {
            state.stages.insert(stage.id, stage.clone());
        }
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Execution>> {
        Ok(self.state.lock().unwrap().executions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        pipeline_id: Uuid,
        key: &str,
    ) -> RepoResult<Option<Execution>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .find(|e| e.pipeline_id == pipeline_id && e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_by_pipeline(&self, pipeline_id: Uuid, limit: u32) -> RepoResult<Vec<Execution>> {
        let state = self.state.lock().unwrap();
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.number.cmp(&a.number));
        executions.truncate(limit as usize);
        Ok(executions)
    }

    async fn list_pending_for_ref(
        &self,
        pipeline_id: Uuid,
        source_ref: &str,
    ) -> RepoResult<Vec<Execution>> {
        let state = self.state.lock().unwrap();
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| {
                e.pipeline_id == pipeline_id
                    && e.refs.source_ref == source_ref
                    && e.status == ExecutionStatus::Pending
            })
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.number);
        Ok(executions)
    }

    async fn count_by_status(&self) -> RepoResult<Vec<(ExecutionStatus, u64)>> {
        let state = self.state.lock().unwrap();
        let mut counts: HashMap<ExecutionStatus, u64> = HashMap::new();
        for execution in state.executions.values() {
            *counts.entry(execution.status).or_default() += 1;
        }
        let mut counts: Vec<(ExecutionStatus, u64)> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }

    async fn update(&self, execution: &Execution, from: &[ExecutionStatus]) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.executions.get_mut(&execution.id) {
            Some(stored) if from.contains(&stored.status) => {
                *stored = execution.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepoError::NotFound(format!("execution {}", execution.id))),
        }
    }

    async fn find_stage(&self, id: Uuid) -> RepoResult<Option<Stage>> {
        Ok(self.state.lock().unwrap().stages.get(&id).cloned())
    }

    async fn list_stages(&self, execution_id: Uuid) -> RepoResult<Vec<Stage>> {
        let state = self.state.lock().unwrap();
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.number);
        Ok(stages)
    }

    async fn list_pending_stages(&self, labels: &[String], limit: u32) -> RepoResult<Vec<Stage>> {
        let state = self.state.lock().unwrap();
        let mut stages: Vec<(DateTime<Utc>, Stage)> = state
            .stages
            .values()
            .filter(|s| {
                s.status == StageStatus::Pending
                    && !s.cancel_requested
                    && labels_satisfy(labels, &s.labels)
            })
            .map(|s| {
                let created = state
                    .executions
                    .get(&s.execution_id)
                    .map(|e| e.created_at)
                    .unwrap_or(s.updated_at);
                (created, s.clone())
            })
            .collect();
        stages.sort_by(|(a_at, a), (b_at, b)| {
            a_at.cmp(b_at)
                .then(a.execution_id.cmp(&b.execution_id))
                .then(a.number.cmp(&b.number))
        });
        Ok(stages
            .into_iter()
            .take(limit as usize)
            .map(|(_, s)| s)
            .collect())
    }

    async fn list_expired_stages(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<Stage>> {
        let state = self.state.lock().unwrap();
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|s| {
                s.status == StageStatus::Running
                    && s.lease.as_ref().is_none_or(|lease| lease.is_expired(now))
            })
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.lease.as_ref().map(|l| l.expires_at));
        stages.truncate(limit as usize);
        Ok(stages)
    }

    async fn claim_stage(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Stage>> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(stage) = state.stages.get_mut(&id) else {
            return Err(RepoError::NotFound(format!("stage {}", id)));
        };
        let canceled = state
            .executions
            .get(&stage.execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Canceled);
        if stage.status != StageStatus::Pending || stage.cancel_requested || canceled {
            return Ok(None);
        }
        stage.status = StageStatus::Running;
        stage.lease = Some(StageLease {
            runner_id: runner_id.to_string(),
            expires_at,
        });
        stage.started_at.get_or_insert(now);
        stage.updated_at = now;
        Ok(Some(stage.clone()))
    }

    async fn renew_stage_lease(
        &self,
        id: Uuid,
        runner_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(stage) = state.stages.get_mut(&id) else {
            return Ok(false);
        };
        if stage.status != StageStatus::Running {
            return Ok(false);
        }
        match stage.lease.as_mut() {
            Some(lease) if lease.runner_id == runner_id && !lease.is_expired(now) => {
                lease.expires_at = expires_at;
                stage.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_stage(&self, stage: &Stage, from: StageStatus) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.stages.get_mut(&stage.id) else {
            return Err(RepoError::NotFound(format!("stage {}", stage.id)));
        };
        if stored.status != from {
            return Ok(false);
        }
        let lease = if stage.status == StageStatus::Running {
            stored.lease.clone()
        } else {
            stage.lease.clone()
        };
        *stored = stage.clone();
        stored.lease = lease;
        Ok(true)
    }

    async fn find_step(&self, id: Uuid) -> RepoResult<Option<Step>> {
        Ok(self.state.lock().unwrap().steps.get(&id).cloned())
    }

    async fn list_steps(&self, stage_id: Uuid) -> RepoResult<Vec<Step>> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<Step> = state
            .steps
            .values()
            .filter(|s| s.stage_id == stage_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.number);
        Ok(steps)
    }

    async fn update_step(&self, step: &Step, from: StepStatus) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.steps.get_mut(&step.id) else {
            return Err(RepoError::NotFound(format!("step {}", step.id)));
        };
        if stored.status != from {
            return Ok(false);
        }
        *stored = step.clone();
        Ok(true)
    }

    async fn append_logs(&self, step_id: Uuid, lines: &[LogLine]) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .logs
            .entry(step_id)
            .or_default()
            .extend(lines.iter().cloned());
        Ok(())
    }

    async fn list_logs(&self, step_id: Uuid) -> RepoResult<Vec<LogLine>> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.get(&step_id).cloned().unwrap_or_default())
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let mut state = self.state.lock().unwrap();
        let State {
            executions,
            steps,
            logs,
            ..
        } = &mut *state;
        let mut deleted = 0;
        for step in steps.values() {
            let finished_before = executions
                .get(&step.execution_id)
                .and_then(|e| e.finished_at)
                .is_some_and(|at| at < cutoff);
            if finished_before {
                if let Some(lines) = logs.remove(&step.id) {
                    deleted += lines.len() as u64;
                }
            }
        }
        Ok(deleted)
    }
}

// =============================================================================
// Webhooks
// =============================================================================

#[async_trait]
impl WebhookRepository for MemoryStore {
    async fn create(&self, webhook: &Webhook) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        state.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn update(&self, webhook: &Webhook) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.webhooks.get_mut(&webhook.id) {
            Some(stored) => {
                *stored = webhook.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Webhook>> {
        Ok(self.state.lock().unwrap().webhooks.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        Ok(self.state.lock().unwrap().webhooks.remove(&id).is_some())
    }

    async fn list_by_scope(&self, scope: &WebhookScope) -> RepoResult<Vec<Webhook>> {
        let state = self.state.lock().unwrap();
        let mut webhooks: Vec<Webhook> = state
            .webhooks
            .values()
            .filter(|w| &w.scope == scope)
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn list_targets(
        &self,
        repo_id: &str,
        pipeline_id: Option<Uuid>,
    ) -> RepoResult<Vec<Webhook>> {
        let state = self.state.lock().unwrap();
        let mut webhooks: Vec<Webhook> = state
            .webhooks
            .values()
            .filter(|w| match &w.scope {
                WebhookScope::Repository(repo) => repo == repo_id,
                WebhookScope::Pipeline(id) => Some(*id) == pipeline_id,
            })
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn append_delivery(&self, delivery: &WebhookDelivery) -> RepoResult<()> {
        self.state.lock().unwrap().deliveries.push(delivery.clone());
        Ok(())
    }

    async fn find_delivery(&self, id: Uuid) -> RepoResult<Option<WebhookDelivery>> {
        let state = self.state.lock().unwrap();
        Ok(state.deliveries.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: u32,
    ) -> RepoResult<Vec<WebhookDelivery>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deliveries
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_deliveries_for_event(
        &self,
        webhook_id: Uuid,
        event: &EventPosition,
    ) -> RepoResult<Vec<WebhookDelivery>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.webhook_id == webhook_id && d.event.as_ref() == Some(event))
            .cloned()
            .collect())
    }

    async fn list_open_deliveries(&self, limit: u32) -> RepoResult<Vec<WebhookDelivery>> {
        let state = self.state.lock().unwrap();
        let mut open: Vec<((DateTime<Utc>, usize), WebhookDelivery)> =
            open_chains(&state.deliveries)
                .into_iter()
                .filter(|(_, last)| last.next_retry_at.is_some())
                .map(|(opened_at, last)| (opened_at, last.clone()))
                .collect();
        open.sort_by_key(|(opened_at, _)| *opened_at);
        Ok(open
            .into_iter()
            .take(limit as usize)
            .map(|(_, d)| d)
            .collect())
    }

    async fn has_open_deliveries(&self, webhook_id: Uuid) -> RepoResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(open_chains(&state.deliveries)
            .into_iter()
            .any(|(_, last)| last.webhook_id == webhook_id && last.next_retry_at.is_some()))
    }

    async fn delete_deliveries_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.deliveries.len();
        state.deliveries.retain(|d| d.created_at >= cutoff);
        Ok((before - state.deliveries.len()) as u64)
    }
}

/// Every delivery chain with its start (time, then insertion order) and
/// latest record
fn open_chains(
    deliveries: &[WebhookDelivery],
) -> Vec<((DateTime<Utc>, usize), &WebhookDelivery)> {
    let mut chains: HashMap<Uuid, ((DateTime<Utc>, usize), &WebhookDelivery)> = HashMap::new();
    for (index, delivery) in deliveries.iter().enumerate() {
        chains
            .entry(delivery.chain_id)
            .and_modify(|(_, last)| {
                if delivery.attempt > last.attempt {
                    *last = delivery;
                }
            })
            .or_insert(((delivery.created_at, index), delivery));
    }
    chains.into_values().collect()
}

// =============================================================================
// Jobs, checks and runners
// =============================================================================

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_if_absent(&self, job: &Job) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job.id) {
            return Ok(false);
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        limit: u32,
    ) -> RepoResult<Vec<Job>> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|job| match job.state {
                JobState::Scheduled => job.run_at <= now,
                JobState::Running => job.lease_expires_at.is_none_or(|at| at <= now),
                JobState::Succeeded | JobState::Dead => false,
            })
            .collect();
        due.sort_by_key(|job| job.run_at);

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|job| {
                job.state = JobState::Running;
                job.lease_holder = Some(holder.to_string());
                job.lease_expires_at = Some(lease_expires_at);
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(id) {
            Some(job)
                if job.state == JobState::Running
                    && job.lease_holder.as_deref() == Some(holder)
                    && job.lease_expires_at.is_some_and(|at| at > now) =>
            {
                job.lease_expires_at = Some(lease_expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn store_result(&self, job: &Job, holder: &str) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.lease_holder.as_deref() == Some(holder) => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepoError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn list_by_state(&self, state_filter: JobState, limit: u32) -> RepoResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.state == state_filter)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }
}

#[async_trait]
impl CheckRepository for MemoryStore {
    async fn upsert(&self, check: &Check) -> RepoResult<()> {
        let key = (
            check.repo_id.clone(),
            check.commit_sha.clone(),
            check.uid.clone(),
        );
        self.state.lock().unwrap().checks.insert(key, check.clone());
        Ok(())
    }

    async fn list_for_commit(&self, repo_id: &str, commit_sha: &str) -> RepoResult<Vec<Check>> {
        let state = self.state.lock().unwrap();
        let mut checks: Vec<Check> = state
            .checks
            .values()
            .filter(|c| c.repo_id == repo_id && c.commit_sha == commit_sha)
            .cloned()
            .collect();
        checks.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(checks)
    }
}

#[async_trait]
impl RunnerRepository for MemoryStore {
    async fn upsert(&self, runner: &Runner) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .runners
            .entry(runner.id.clone())
            .and_modify(|stored| {
                stored.labels = runner.labels.clone();
                stored.last_seen_at = runner.last_seen_at;
            })
            .or_insert_with(|| runner.clone());
        Ok(())
    }

    async fn list_all(&self) -> RepoResult<Vec<Runner>> {
        let state = self.state.lock().unwrap();
        let mut runners: Vec<Runner> = state.runners.values().cloned().collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runners)
    }
}

// =============================================================================
// Leases and the event log
// =============================================================================

#[async_trait]
impl LeaseRepository for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<u64>> {
        let mut state = self.state.lock().unwrap();
        match state.leases.get_mut(key) {
            Some(record) if record.holder.is_some() && record.expires_at > now => Ok(None),
            Some(record) => {
                record.holder = Some(holder.to_string());
                record.expires_at = expires_at;
                record.token += 1;
                Ok(Some(record.token))
            }
            None => {
                state.leases.insert(
                    key.to_string(),
                    LeaseRecord {
                        holder: Some(holder.to_string()),
                        expires_at,
                        token: 1,
                    },
                );
                Ok(Some(1))
            }
        }
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.leases.get_mut(key) {
            Some(record) if record.holder.as_deref() == Some(holder) && record.expires_at > now => {
                record.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> RepoResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.leases.get_mut(key) {
            Some(record) if record.holder.as_deref() == Some(holder) => {
                record.holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(
        &self,
        stream: &str,
        partition_key: &str,
        payload: &[u8],
        produced_at: DateTime<Utc>,
    ) -> RepoResult<Event> {
        let mut state = self.state.lock().unwrap();
        let events = state.streams.entry(stream.to_string()).or_default();
        let event = Event {
            stream: stream.to_string(),
            offset: events.len() as i64 + 1,
            partition_key: partition_key.to_string(),
            payload: payload.to_vec(),
            produced_at,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn read(&self, stream: &str, after: i64, limit: u32) -> RepoResult<Vec<Event>> {
        let state = self.state.lock().unwrap();
        let Some(events) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        // Offsets are dense and start at 1
        let start = after.max(0) as usize;
        Ok(events
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn load_checkpoint(&self, stream: &str, group: &str) -> RepoResult<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .checkpoints
            .get(&(stream.to_string(), group.to_string()))
            .copied())
    }

    async fn store_checkpoint(&self, stream: &str, group: &str, offset: i64) -> RepoResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .checkpoints
            .insert((stream.to_string(), group.to_string()), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_event_offsets_are_dense_per_stream() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..3 {
            let event = store.append("git", "acme/api", b"{}", now).await.unwrap();
            assert_eq!(event.offset, i + 1);
        }
        let other = store.append("pullreq", "acme/api", b"{}", now).await.unwrap();
        assert_eq!(other.offset, 1);

        let tail = store.read("git", 1, 10).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_lease_fencing_tokens_increase() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store
            .try_acquire("k", "a", now + Duration::seconds(30), now)
            .await
            .unwrap();
        assert_eq!(first, Some(1));

        let busy = store
            .try_acquire("k", "b", now + Duration::seconds(30), now)
            .await
            .unwrap();
        assert_eq!(busy, None);

        let later = now + Duration::seconds(31);
        let second = store
            .try_acquire("k", "b", later + Duration::seconds(30), later)
            .await
            .unwrap();
        assert_eq!(second, Some(2));
        assert!(!store.renew("k", "a", later, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_claimed_jobs_are_not_claimed_twice() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = Job {
            id: "once".to_string(),
            kind: "noop".to_string(),
            payload: serde_json::Value::Null,
            state: JobState::Scheduled,
            schedule: gantry_core::domain::job::JobSchedule::Once,
            run_at: now,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(store.insert_if_absent(&job).await.unwrap());
        assert!(!store.insert_if_absent(&job).await.unwrap());

        let lease = now + Duration::seconds(60);
        assert_eq!(store.claim_due(now, "w1", lease, 10).await.unwrap().len(), 1);
        assert!(store.claim_due(now, "w2", lease, 10).await.unwrap().is_empty());

        // Expired worker lease makes the job claimable again
        let later = lease + Duration::seconds(1);
        let reclaimed = store.claim_due(later, "w2", later, 10).await.unwrap();
        assert_eq!(reclaimed[0].lease_holder.as_deref(), Some("w2"));
    }
}
