//! Execution Manager
//!
//! Owns the execution, stage and step state machines. Every mutation goes
//! through this type:
//!
//! - creation allocates the pipeline's next sequence number under the
//!   `execution-manager:pipeline:{id}` lock
//! - runners claim stages with an atomic compare-and-set in storage
//! - step reports settle stages and cascade to the execution under the
//!   `execution-manager:execution:{id}` lock
//! - the lease sweep returns abandoned stages to the pool
//!
//! State changes are published on the `execution` stream and mirrored to the
//! live streamer and commit checks.

pub mod graph;
pub mod status;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::domain::event::{EventPosition, ExecutionEvent, ExecutionEventKind, streams};
use gantry_core::domain::execution::{
    Execution, ExecutionRefs, ExecutionStatus, Stage, StageStatus, Step, StepStatus,
    TriggerCause,
};
use gantry_core::domain::log::LogLine;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::runner::Runner;
use gantry_core::dto::execution::{ExecutionDetail, RunPipeline, StageDetail};
use gantry_core::dto::runner::{
    HeartbeatResponse, PollRequest, StageAssignment, StageDefinition, StepAck, StepReport,
};

use crate::bus::EventBus;
use crate::clock::{SharedClock, to_chrono};
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::git::{GitError, GitProvider};
use crate::lock::{LockHandle, LockManager};
use crate::repository::{
    ExecutionRepository, PipelineRepository, RepoError, Repositories, RunnerRepository,
};
use crate::service::check::CheckReporter;
use crate::service::stream::{LogStream, StatusUpdate, Streamer};

use graph::PipelineDocument;

/// Request to create an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub pipeline_id: Uuid,
    pub cause: TriggerCause,
    pub refs: ExecutionRefs,
    pub params: HashMap<String, String>,
    /// Replays carrying the same key return the existing execution
    pub idempotency_key: Option<String>,
    pub source_event: Option<EventPosition>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Created {
    New(Execution),
    /// The idempotency key was already used
    Duplicate(Execution),
}

impl Created {
    pub fn is_new(&self) -> bool {
        matches!(self, Created::New(_))
    }

    pub fn execution(&self) -> &Execution {
        match self {
            Created::New(e) | Created::Duplicate(e) => e,
        }
    }

    pub fn into_execution(self) -> Execution {
        match self {
            Created::New(e) | Created::Duplicate(e) => e,
        }
    }
}

/// Outcome of one lease sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Returned to the pool
    pub reclaimed: usize,
    /// Reclaim ceiling reached
    pub errored: usize,
    /// Belonged to a canceled execution
    pub canceled: usize,
}

/// First phase of a cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelPhase {
    /// The execution finished before the request arrived
    AlreadyFinished(ExecutionStatus),
    /// Running stages that were asked to stop
    Draining { running: Vec<Uuid> },
}

/// Live observers of state changes
#[derive(Clone)]
pub struct Observers {
    pub streamer: Arc<Streamer>,
    pub logs: Arc<LogStream>,
    pub checks: Arc<CheckReporter>,
}

enum Reclaim {
    Pool,
    Errored,
    Canceled,
}

pub struct ExecutionManager {
    pipelines: Arc<dyn PipelineRepository>,
    executions: Arc<dyn ExecutionRepository>,
    runners: Arc<dyn RunnerRepository>,
    locks: LockManager,
    bus: EventBus,
    git: Arc<dyn GitProvider>,
    clock: SharedClock,
    config: ExecutionConfig,
    observers: Observers,
    stage_ready: Notify,
}

impl ExecutionManager {
    pub fn new(
        repos: &Repositories,
        locks: LockManager,
        bus: EventBus,
        git: Arc<dyn GitProvider>,
        clock: SharedClock,
        config: ExecutionConfig,
        observers: Observers,
    ) -> Self {
        Self {
            pipelines: repos.pipelines.clone(),
            executions: repos.executions.clone(),
            runners: repos.runners.clone(),
            locks,
            bus,
            git,
            clock,
            config,
            observers,
            stage_ready: Notify::new(),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Creates an execution and its stage graph.
    ///
    /// Fails with `ConfigInvalid` when the pipeline document is missing or
    /// its graph is malformed. A known idempotency key is a no-op.
    pub async fn create_execution(&self, req: NewExecution) -> Result<Created> {
        let pipeline = self.pipeline(req.pipeline_id).await?;

        if let Some(existing) = self.find_duplicate(&pipeline, &req).await? {
            debug!(execution_id = %existing.id, "Duplicate execution request ignored");
            return Ok(Created::Duplicate(existing));
        }

        let document = self
            .load_document(&pipeline, &req.refs.commit_sha)
            .await?;

        let key = LockManager::key("execution-manager:pipeline", pipeline.id);
        let handle = self
            .locks
            .acquire_with_retry(
                &key,
                self.config.lock_lease,
                self.config.lock_retry_attempts,
                self.config.lock_retry_delay,
            )
            .await?;
        let outcome = self.create_locked(&handle, &pipeline, &document, req).await;
        self.release(handle).await;

        let created = outcome?;
        if let Created::New(execution) = &created {
            info!(
                execution_id = %execution.id,
                pipeline_id = %execution.pipeline_id,
                number = execution.number,
                cause = %execution.cause,
                "Execution created"
            );
            self.emit(ExecutionEventKind::Created, execution, None).await?;
            self.stage_ready.notify_waiters();
        }
        Ok(created)
    }

    async fn create_locked(
        &self,
        handle: &LockHandle,
        pipeline: &Pipeline,
        document: &PipelineDocument,
        req: NewExecution,
    ) -> Result<Created> {
        // A concurrent request with the same key may have won while we waited
        if let Some(existing) = self.find_duplicate(pipeline, &req).await? {
            return Ok(Created::Duplicate(existing));
        }

        self.ensure_valid(handle)?;
        let number = self.pipelines.next_sequence(pipeline.id).await?;
        let now = self.clock.now();
        let execution = Execution {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            repo_id: pipeline.repo_id.clone(),
            number,
            cause: req.cause,
            refs: req.refs.clone(),
            status: ExecutionStatus::Pending,
            fail_fast: document.fail_fast,
            params: req.params.clone(),
            idempotency_key: req.idempotency_key.clone(),
            source_event: req.source_event.clone(),
            triggered_by: req.triggered_by.clone(),
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        let (stages, steps) = document.materialize(execution.id, now);

        self.ensure_valid(handle)?;
        match self.executions.create(&execution, &stages, &steps).await {
            Ok(()) => Ok(Created::New(execution)),
            Err(RepoError::Conflict(msg)) => match self.find_duplicate(pipeline, &req).await? {
                Some(existing) => Ok(Created::Duplicate(existing)),
                None => Err(Error::Conflict(msg)),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn find_duplicate(&self, pipeline: &Pipeline, req: &NewExecution) -> Result<Option<Execution>> {
        match &req.idempotency_key {
            Some(key) => Ok(self
                .executions
                .find_by_idempotency_key(pipeline.id, key)
                .await?),
            None => Ok(None),
        }
    }

    async fn load_document(&self, pipeline: &Pipeline, commit_sha: &str) -> Result<PipelineDocument> {
        let source = self
            .git
            .read_file(&pipeline.repo_id, commit_sha, &pipeline.config_path)
            .await
            .map_err(|e| match e {
                GitError::NotFound(what) => {
                    Error::ConfigInvalid(format!("pipeline document not found: {}", what))
                }
                other => other.into(),
            })?;
        PipelineDocument::parse(&source)
    }

    /// Runs a pipeline on demand against a branch head
    pub async fn run_manual(&self, pipeline_id: Uuid, req: RunPipeline) -> Result<Execution> {
        let created = self
            .run_branch(pipeline_id, TriggerCause::Manual, req, None)
            .await?;
        Ok(created.into_execution())
    }

    /// Runs a pipeline for a cron tick; the key makes each tick run once
    pub async fn run_scheduled(
        &self,
        pipeline_id: Uuid,
        req: RunPipeline,
        idempotency_key: String,
    ) -> Result<Created> {
        self.run_branch(pipeline_id, TriggerCause::Cron, req, Some(idempotency_key))
            .await
    }

    async fn run_branch(
        &self,
        pipeline_id: Uuid,
        cause: TriggerCause,
        req: RunPipeline,
        idempotency_key: Option<String>,
    ) -> Result<Created> {
        let pipeline = self.pipeline(pipeline_id).await?;
        let branch = req
            .branch
            .unwrap_or_else(|| pipeline.default_branch.clone());
        let ref_name = if branch.starts_with("refs/") {
            branch
        } else {
            format!("refs/heads/{}", branch)
        };
        let commit_sha = self.git.resolve_ref(&pipeline.repo_id, &ref_name).await?;

        self.create_execution(NewExecution {
            pipeline_id,
            cause,
            refs: ExecutionRefs {
                source_ref: ref_name.clone(),
                target_ref: ref_name,
                commit_sha,
                before_sha: None,
            },
            params: req.params,
            idempotency_key,
            source_event: None,
            triggered_by: req.triggered_by,
        })
        .await
    }

    // =========================================================================
    // Runner protocol
    // =========================================================================

    /// Long-polls for a stage this runner may execute.
    ///
    /// Blocks up to the requested wait (capped by configuration) and returns
    /// `None` when nothing became runnable.
    pub async fn poll(&self, req: &PollRequest) -> Result<Option<StageAssignment>> {
        if req.runner_id.trim().is_empty() {
            return Err(Error::Validation("runner_id cannot be empty".to_string()));
        }
        self.touch_runner(&req.runner_id, &req.labels).await?;

        let wait = req
            .wait_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.max_poll_wait)
            .min(self.config.max_poll_wait);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let ready = self.stage_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(stage) = self
                .next_schedulable_stage(&req.runner_id, &req.labels)
                .await?
            {
                let lease_expires_at = stage
                    .lease
                    .as_ref()
                    .map(|l| l.expires_at)
                    .unwrap_or_else(|| self.clock.now());
                return Ok(Some(StageAssignment {
                    stage_id: stage.id,
                    execution_id: stage.execution_id,
                    lease_expires_at,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Stages released by other instances do not notify; rescan periodically
            let nap = (deadline - now).min(Duration::from_secs(1));
            tokio::select! {
                _ = &mut ready => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Claims one runnable stage whose labels this runner satisfies.
    ///
    /// The final write is a compare-and-set, so concurrent callers never
    /// receive the same stage.
    pub async fn next_schedulable_stage(
        &self,
        runner_id: &str,
        labels: &[String],
    ) -> Result<Option<Stage>> {
        let candidates = self
            .executions
            .list_pending_stages(labels, self.config.claim_scan_limit)
            .await?;

        for candidate in candidates {
            if !self.dependencies_met(&candidate).await? {
                continue;
            }

            let now = self.clock.now();
            let expires_at = now + to_chrono(self.config.stage_lease);
            let Some(stage) = self
                .executions
                .claim_stage(candidate.id, runner_id, expires_at, now)
                .await?
            else {
                debug!(stage_id = %candidate.id, runner_id, "Stage claimed by another runner");
                continue;
            };

            if self.on_claimed(&stage).await? {
                info!(
                    stage_id = %stage.id,
                    execution_id = %stage.execution_id,
                    stage = %stage.name,
                    runner_id,
                    "Stage claimed"
                );
                return Ok(Some(stage));
            }
        }
        Ok(None)
    }

    async fn dependencies_met(&self, stage: &Stage) -> Result<bool> {
        let execution = self.execution(stage.execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        if stage.depends_on.is_empty() {
            return Ok(true);
        }
        let siblings = self.executions.list_stages(stage.execution_id).await?;
        Ok(stage.depends_on.iter().all(|dep| {
            siblings
                .iter()
                .any(|s| &s.name == dep && s.status.is_success())
        }))
    }

    /// Marks the execution running on its first claim. Returns false when the
    /// execution was canceled in the meantime and the claim was undone.
    async fn on_claimed(&self, stage: &Stage) -> Result<bool> {
        let execution = self.execution(stage.execution_id).await?;
        let now = self.clock.now();

        if execution.status == ExecutionStatus::Canceled {
            let mut undone = stage.clone();
            undone.status = StageStatus::Canceled;
            undone.lease = None;
            undone.finished_at = Some(now);
            undone.updated_at = now;
            if self
                .executions
                .update_stage(&undone, StageStatus::Running)
                .await?
            {
                self.finish_steps(undone.id, StepStatus::Canceled).await?;
                self.emit_stage(&execution, &undone).await?;
            }
            return Ok(false);
        }

        let execution = if execution.status == ExecutionStatus::Pending {
            let mut started = execution.clone();
            started.status = ExecutionStatus::Running;
            started.started_at = Some(now);
            started.updated_at = now;
            if self
                .executions
                .update(&started, &[ExecutionStatus::Pending])
                .await?
            {
                self.emit(ExecutionEventKind::Started, &started, None).await?;
                started
            } else {
                self.execution(stage.execution_id).await?
            }
        } else {
            execution
        };

        self.emit_stage(&execution, stage).await?;
        Ok(true)
    }

    /// Extends the runner's lease; the answer carries the cancel signal
    pub async fn heartbeat(&self, stage_id: Uuid, runner_id: &str) -> Result<HeartbeatResponse> {
        let stage = self.stage(stage_id).await?;
        let now = self.clock.now();

        if stage.status == StageStatus::Canceled {
            return Ok(HeartbeatResponse {
                lease_expires_at: now,
                cancel: true,
            });
        }
        self.check_holder(&stage, runner_id)?;

        let expires_at = now + to_chrono(self.config.stage_lease);
        if !self
            .executions
            .renew_stage_lease(stage_id, runner_id, expires_at, now)
            .await?
        {
            return Err(Error::LeaseLost(format!("stage {}", stage_id)));
        }

        let execution = self.execution(stage.execution_id).await?;
        let cancel = stage.cancel_requested || execution.status == ExecutionStatus::Canceled;
        debug!(stage_id = %stage_id, runner_id, cancel, "Stage lease renewed");
        Ok(HeartbeatResponse {
            lease_expires_at: expires_at,
            cancel,
        })
    }

    /// Stage and step definitions for the runner that claimed the stage
    pub async fn fetch_stage(&self, stage_id: Uuid) -> Result<StageDefinition> {
        let stage = self.stage(stage_id).await?;
        let execution = self.execution(stage.execution_id).await?;
        let steps = self.executions.list_steps(stage_id).await?;

        let mut env = execution.params.clone();
        env.extend([
            ("GANTRY_EXECUTION_ID".to_string(), execution.id.to_string()),
            ("GANTRY_EXECUTION_NUMBER".to_string(), execution.number.to_string()),
            ("GANTRY_PIPELINE_ID".to_string(), execution.pipeline_id.to_string()),
            ("GANTRY_REPO_ID".to_string(), execution.repo_id.clone()),
            ("GANTRY_COMMIT_SHA".to_string(), execution.refs.commit_sha.clone()),
            ("GANTRY_SOURCE_REF".to_string(), execution.refs.source_ref.clone()),
            ("GANTRY_TARGET_REF".to_string(), execution.refs.target_ref.clone()),
            ("GANTRY_TRIGGER".to_string(), execution.cause.to_string()),
            ("GANTRY_STAGE".to_string(), stage.name.clone()),
        ]);

        let secrets: BTreeSet<String> = steps
            .iter()
            .flat_map(|s| s.secrets.iter().cloned())
            .collect();

        Ok(StageDefinition {
            stage,
            steps,
            env,
            secrets: secrets.into_iter().collect(),
        })
    }

    /// Records a step status and log chunk.
    ///
    /// Once cancellation was requested, `running` and `success` reports are
    /// recorded as `canceled`. A terminal report settles the stage and
    /// cascades to the execution.
    pub async fn report_step(&self, step_id: Uuid, report: StepReport) -> Result<StepAck> {
        let step = self.step(step_id).await?;
        let stage = self.stage(step.stage_id).await?;
        let execution = self.execution(step.execution_id).await?;

        if stage.status.is_terminal() {
            // Forced out of the runner's hands (canceled or reclaimed to error)
            return Ok(StepAck {
                recorded: step.status,
                cancel: true,
            });
        }
        self.check_holder(&stage, &report.runner_id)?;

        if !report.log.is_empty() {
            self.executions.append_logs(step_id, &report.log).await?;
            self.observers.logs.publish(step_id, &report.log);
        }

        let canceling = stage.cancel_requested || execution.status == ExecutionStatus::Canceled;
        let requested = coerce_for_cancel(report.status, canceling);

        if step.status.is_terminal() {
            // Replayed report; let the stage catch up in case the first one
            // failed halfway
            self.settle_stage(&stage).await?;
            return Ok(StepAck {
                recorded: step.status,
                cancel: canceling,
            });
        }
        if requested == step.status {
            return Ok(StepAck {
                recorded: requested,
                cancel: canceling,
            });
        }
        if requested == StepStatus::Pending {
            return Err(Error::Validation(format!(
                "step {} cannot move back to pending",
                step_id
            )));
        }

        let now = self.clock.now();
        let mut updated = step.clone();
        updated.status = requested;
        updated.started_at.get_or_insert(now);
        if requested.is_terminal() {
            updated.finished_at = Some(now);
            updated.exit_code = report.exit_code;
            updated.error = report.error.clone();
        }
        if !self.executions.update_step(&updated, step.status).await? {
            return Err(Error::Conflict(format!("step {} changed concurrently", step_id)));
        }
        debug!(step_id = %step_id, status = %requested, "Step updated");
        self.observers
            .streamer
            .publish(StatusUpdate::Step(updated.clone()));

        if requested.is_terminal() {
            self.observers.logs.close(step_id);
            self.settle_stage(&stage).await?;
        }
        Ok(StepAck {
            recorded: requested,
            cancel: canceling,
        })
    }

    fn check_holder(&self, stage: &Stage, runner_id: &str) -> Result<()> {
        let holds = stage.status == StageStatus::Running
            && stage
                .lease
                .as_ref()
                .is_some_and(|l| l.runner_id == runner_id);
        if holds {
            Ok(())
        } else {
            Err(Error::LeaseLost(format!(
                "stage {} is not leased to {}",
                stage.id, runner_id
            )))
        }
    }

    async fn touch_runner(&self, runner_id: &str, labels: &[String]) -> Result<()> {
        let now = self.clock.now();
        self.runners
            .upsert(&Runner {
                id: runner_id.to_string(),
                labels: labels.to_vec(),
                registered_at: now,
                last_seen_at: now,
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // State advancement
    // =========================================================================

    async fn settle_stage(&self, stage: &Stage) -> Result<()> {
        let handle = self.lock_execution(stage.execution_id).await?;
        let outcome = self.settle_stage_locked(&handle, stage.id).await;
        self.release(handle).await;
        outcome
    }

    async fn settle_stage_locked(&self, handle: &LockHandle, stage_id: Uuid) -> Result<()> {
        let stage = self.stage(stage_id).await?;
        let execution = self.execution(stage.execution_id).await?;

        if stage.status == StageStatus::Running {
            let steps = self.executions.list_steps(stage_id).await?;
            let statuses: Vec<StepStatus> = steps.iter().map(|s| s.status).collect();

            if let Some(mut outcome) = status::stage_outcome(&statuses) {
                let canceling =
                    stage.cancel_requested || execution.status == ExecutionStatus::Canceled;
                if canceling && outcome == StageStatus::Success {
                    outcome = StageStatus::Canceled;
                }
                let now = self.clock.now();
                let mut settled = stage.clone();
                settled.status = outcome;
                settled.lease = None;
                settled.finished_at = Some(now);
                settled.updated_at = now;
                if outcome == StageStatus::Error {
                    settled.error = steps.iter().find_map(|s| s.error.clone());
                }

                self.ensure_valid(handle)?;
                if self
                    .executions
                    .update_stage(&settled, StageStatus::Running)
                    .await?
                {
                    info!(
                        stage_id = %settled.id,
                        execution_id = %settled.execution_id,
                        stage = %settled.name,
                        status = %outcome,
                        "Stage finished"
                    );
                    self.emit_stage(&execution, &settled).await?;
                }
            }
        }

        self.advance_locked(handle, stage.execution_id).await
    }

    /// Applies fail-fast, releases or skips waiting stages and settles the
    /// execution once every stage is terminal
    async fn advance_locked(&self, handle: &LockHandle, execution_id: Uuid) -> Result<()> {
        let execution = self.execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        let stages = self.executions.list_stages(execution_id).await?;
        if stages.iter().any(status::trips_fail_fast) {
            self.apply_fail_fast(handle, &execution, &stages).await?;
        }

        let stages = self.executions.list_stages(execution_id).await?;
        let mut released = false;
        for (stage_id, next_status) in status::resolve_waiting(&stages) {
            let Some(stage) = stages.iter().find(|s| s.id == stage_id) else {
                continue;
            };
            let now = self.clock.now();
            let mut next = stage.clone();
            next.status = next_status;
            next.updated_at = now;
            if next_status == StageStatus::Skipped {
                next.finished_at = Some(now);
                next.error = Some("a dependency did not succeed".to_string());
            }

            self.ensure_valid(handle)?;
            if !self
                .executions
                .update_stage(&next, StageStatus::Waiting)
                .await?
            {
                continue;
            }
            if next_status == StageStatus::Skipped {
                self.finish_steps(next.id, StepStatus::Skipped).await?;
            } else {
                released = true;
            }
            debug!(stage_id = %next.id, stage = %next.name, status = %next_status, "Waiting stage resolved");
            self.emit_stage(&execution, &next).await?;
        }
        if released {
            self.stage_ready.notify_waiters();
        }

        let stages = self.executions.list_stages(execution_id).await?;
        let statuses: Vec<StageStatus> = stages.iter().map(|s| s.status).collect();
        if let Some(outcome) = status::execution_outcome(&statuses) {
            let now = self.clock.now();
            let mut finished = execution.clone();
            finished.status = outcome;
            finished.started_at.get_or_insert(now);
            finished.finished_at = Some(now);
            finished.updated_at = now;
            if outcome == ExecutionStatus::Error {
                finished.error = stages.iter().find_map(|s| s.error.clone());
            }

            self.ensure_valid(handle)?;
            if self
                .executions
                .update(
                    &finished,
                    &[ExecutionStatus::Pending, ExecutionStatus::Running],
                )
                .await?
            {
                info!(
                    execution_id = %finished.id,
                    number = finished.number,
                    status = %outcome,
                    "Execution finished"
                );
                self.emit(ExecutionEventKind::Completed, &finished, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_fail_fast(
        &self,
        handle: &LockHandle,
        execution: &Execution,
        stages: &[Stage],
    ) -> Result<()> {
        for stage in stages.iter().filter(|s| !s.status.is_terminal()) {
            let now = self.clock.now();
            let mut next = stage.clone();
            next.updated_at = now;
            match stage.status {
                StageStatus::Waiting | StageStatus::Pending => {
                    next.status = StageStatus::Skipped;
                    next.finished_at = Some(now);
                    next.error = Some("skipped by fail-fast".to_string());
                    self.ensure_valid(handle)?;
                    if self.executions.update_stage(&next, stage.status).await? {
                        self.finish_steps(next.id, StepStatus::Skipped).await?;
                        self.emit_stage(execution, &next).await?;
                    }
                }
                StageStatus::Running if !stage.cancel_requested => {
                    next.cancel_requested = true;
                    self.ensure_valid(handle)?;
                    if self
                        .executions
                        .update_stage(&next, StageStatus::Running)
                        .await?
                    {
                        info!(stage_id = %next.id, stage = %next.name, "Fail-fast stopping running stage");
                        self.emit_stage(execution, &next).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Moves every unfinished step of a stage to `status`
    async fn finish_steps(&self, stage_id: Uuid, status: StepStatus) -> Result<()> {
        let now = self.clock.now();
        for step in self.executions.list_steps(stage_id).await? {
            if step.status.is_terminal() {
                continue;
            }
            let mut finished = step.clone();
            finished.status = status;
            finished.finished_at = Some(now);
            if self.executions.update_step(&finished, step.status).await? {
                self.observers.logs.close(step.id);
                self.observers
                    .streamer
                    .publish(StatusUpdate::Step(finished));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lease sweep
    // =========================================================================

    /// Returns stages whose runner stopped heartbeating to the pool, or
    /// forces them to `error` past the reclaim ceiling
    pub async fn sweep_expired_leases(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self
            .executions
            .list_expired_stages(now, self.config.claim_scan_limit)
            .await?;

        let mut report = SweepReport::default();
        for stage in expired {
            let handle = match self.lock_execution(stage.execution_id).await {
                Ok(handle) => handle,
                Err(e) if e.is_contention() => {
                    debug!(stage_id = %stage.id, "Execution busy, sweeping later");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let outcome = self.reclaim_locked(&handle, stage.id).await;
            self.release(handle).await;

            match outcome {
                Ok(Some(Reclaim::Pool)) => report.reclaimed += 1,
                Ok(Some(Reclaim::Errored)) => report.errored += 1,
                Ok(Some(Reclaim::Canceled)) => report.canceled += 1,
                Ok(None) => {}
                Err(e) if e.is_contention() => debug!(stage_id = %stage.id, error = %e, "Reclaim lost a race"),
                Err(e) => warn!(stage_id = %stage.id, error = %e, "Reclaim failed"),
            }
        }

        if report.reclaimed > 0 {
            self.stage_ready.notify_waiters();
        }
        if report != SweepReport::default() {
            info!(?report, "Lease sweep finished");
        }
        Ok(report)
    }

    async fn reclaim_locked(&self, handle: &LockHandle, stage_id: Uuid) -> Result<Option<Reclaim>> {
        let stage = self.stage(stage_id).await?;
        let now = self.clock.now();
        let expired = stage.status == StageStatus::Running
            && stage.lease.as_ref().is_none_or(|l| l.is_expired(now));
        if !expired {
            return Ok(None);
        }
        let execution = self.execution(stage.execution_id).await?;

        let mut next = stage.clone();
        next.lease = None;
        next.updated_at = now;
        let outcome = if stage.cancel_requested || execution.status == ExecutionStatus::Canceled {
            next.status = StageStatus::Canceled;
            next.finished_at = Some(now);
            Reclaim::Canceled
        } else if stage.reclaims >= self.config.max_reclaims as i32 {
            next.status = StageStatus::Error;
            next.finished_at = Some(now);
            next.error = Some(format!(
                "runner lease expired {} times",
                stage.reclaims + 1
            ));
            Reclaim::Errored
        } else {
            next.status = StageStatus::Pending;
            next.reclaims += 1;
            next.started_at = None;
            Reclaim::Pool
        };

        self.ensure_valid(handle)?;
        if !self
            .executions
            .update_stage(&next, StageStatus::Running)
            .await?
        {
            return Ok(None);
        }

        let runner = stage
            .lease
            .as_ref()
            .map(|l| l.runner_id.as_str())
            .unwrap_or("unknown");
        match outcome {
            Reclaim::Pool => {
                warn!(stage_id = %stage.id, runner_id = runner, reclaims = next.reclaims, "Stage lease expired, returned to pool");
                self.reset_steps(stage.id).await?;
            }
            Reclaim::Errored => {
                warn!(stage_id = %stage.id, runner_id = runner, "Stage lease expired too often, giving up");
                self.finish_steps(stage.id, StepStatus::Error).await?;
            }
            Reclaim::Canceled => {
                self.finish_steps(stage.id, StepStatus::Canceled).await?;
            }
        }
        self.emit_stage(&execution, &next).await?;
        self.advance_locked(handle, stage.execution_id).await?;
        Ok(Some(outcome))
    }

    /// A reclaimed stage runs from its first step again
    async fn reset_steps(&self, stage_id: Uuid) -> Result<()> {
        for step in self.executions.list_steps(stage_id).await? {
            if step.status == StepStatus::Pending {
                continue;
            }
            let mut reset = step.clone();
            reset.status = StepStatus::Pending;
            reset.exit_code = None;
            reset.error = None;
            reset.started_at = None;
            reset.finished_at = None;
            self.executions.update_step(&reset, step.status).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Marks the execution canceled, cancels stages that have not started and
    /// asks running ones to stop. Idempotent.
    pub async fn begin_cancel(&self, execution_id: Uuid, reason: &str) -> Result<CancelPhase> {
        let handle = self.lock_execution(execution_id).await?;
        let outcome = self.begin_cancel_locked(&handle, execution_id, reason).await;
        self.release(handle).await;
        outcome
    }

    async fn begin_cancel_locked(
        &self,
        handle: &LockHandle,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<CancelPhase> {
        let mut execution = self.execution(execution_id).await?;
        if execution.status.is_terminal() && execution.status != ExecutionStatus::Canceled {
            return Ok(CancelPhase::AlreadyFinished(execution.status));
        }

        if execution.status != ExecutionStatus::Canceled {
            let now = self.clock.now();
            let mut canceled = execution.clone();
            canceled.status = ExecutionStatus::Canceled;
            canceled.error = Some(reason.to_string());
            canceled.finished_at = Some(now);
            canceled.updated_at = now;

            self.ensure_valid(handle)?;
            if !self
                .executions
                .update(
                    &canceled,
                    &[ExecutionStatus::Pending, ExecutionStatus::Running],
                )
                .await?
            {
                let current = self.execution(execution_id).await?;
                return Ok(CancelPhase::AlreadyFinished(current.status));
            }
            info!(execution_id = %execution_id, reason, "Execution canceled");
            self.emit(ExecutionEventKind::Canceled, &canceled, None)
                .await?;
            execution = canceled;
        }

        let mut running = Vec::new();
        for stage in self.executions.list_stages(execution_id).await? {
            let now = self.clock.now();
            let mut next = stage.clone();
            next.updated_at = now;
            match stage.status {
                StageStatus::Waiting | StageStatus::Pending => {
                    next.status = StageStatus::Canceled;
                    next.finished_at = Some(now);
                    self.ensure_valid(handle)?;
                    if self.executions.update_stage(&next, stage.status).await? {
                        self.finish_steps(next.id, StepStatus::Canceled).await?;
                        self.emit_stage(&execution, &next).await?;
                    }
                }
                StageStatus::Running => {
                    if !stage.cancel_requested {
                        next.cancel_requested = true;
                        self.ensure_valid(handle)?;
                        if self
                            .executions
                            .update_stage(&next, StageStatus::Running)
                            .await?
                        {
                            self.emit_stage(&execution, &next).await?;
                        }
                    }
                    running.push(stage.id);
                }
                _ => {}
            }
        }
        Ok(CancelPhase::Draining { running })
    }

    /// Whether every listed stage reached a terminal state
    pub async fn stages_settled(&self, stage_ids: &[Uuid]) -> Result<bool> {
        for id in stage_ids {
            if !self.stage(*id).await?.status.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Force-cancels stages still running after the grace deadline
    pub async fn force_cancel(&self, execution_id: Uuid) -> Result<usize> {
        let handle = self.lock_execution(execution_id).await?;
        let outcome = self.force_cancel_locked(&handle, execution_id).await;
        self.release(handle).await;
        outcome
    }

    async fn force_cancel_locked(&self, handle: &LockHandle, execution_id: Uuid) -> Result<usize> {
        let execution = self.execution(execution_id).await?;
        let mut forced = 0;
        for stage in self.executions.list_stages(execution_id).await? {
            if stage.status != StageStatus::Running {
                continue;
            }
            let now = self.clock.now();
            let mut next = stage.clone();
            next.status = StageStatus::Canceled;
            next.lease = None;
            next.finished_at = Some(now);
            next.updated_at = now;
            next.error = Some("runner did not acknowledge cancellation in time".to_string());

            self.ensure_valid(handle)?;
            if self
                .executions
                .update_stage(&next, StageStatus::Running)
                .await?
            {
                warn!(stage_id = %stage.id, execution_id = %execution_id, "Stage force-canceled");
                self.finish_steps(stage.id, StepStatus::Canceled).await?;
                self.emit_stage(&execution, &next).await?;
                forced += 1;
            }
        }
        Ok(forced)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> Result<Execution> {
        self.execution(id).await
    }

    pub async fn get_detail(&self, id: Uuid) -> Result<ExecutionDetail> {
        let execution = self.execution(id).await?;
        let mut stages = Vec::new();
        for stage in self.executions.list_stages(id).await? {
            let steps = self.executions.list_steps(stage.id).await?;
            stages.push(StageDetail { stage, steps });
        }
        Ok(ExecutionDetail { execution, stages })
    }

    pub async fn list(&self, pipeline_id: Uuid, limit: u32) -> Result<Vec<Execution>> {
        self.pipeline(pipeline_id).await?;
        Ok(self
            .executions
            .list_by_pipeline(pipeline_id, limit)
            .await?)
    }

    /// Pending executions of a pipeline building `source_ref`
    pub async fn list_pending_for_ref(
        &self,
        pipeline_id: Uuid,
        source_ref: &str,
    ) -> Result<Vec<Execution>> {
        Ok(self
            .executions
            .list_pending_for_ref(pipeline_id, source_ref)
            .await?)
    }

    pub async fn logs(&self, step_id: Uuid) -> Result<Vec<LogLine>> {
        self.step(step_id).await?;
        Ok(self.executions.list_logs(step_id).await?)
    }

    pub async fn step_status(&self, step_id: Uuid) -> Result<StepStatus> {
        Ok(self.step(step_id).await?.status)
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    async fn pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.pipelines
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pipeline {}", id)))
    }

    async fn execution(&self, id: Uuid) -> Result<Execution> {
        self.executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))
    }

    async fn stage(&self, id: Uuid) -> Result<Stage> {
        self.executions
            .find_stage(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("stage {}", id)))
    }

    async fn step(&self, id: Uuid) -> Result<Step> {
        self.executions
            .find_step(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("step {}", id)))
    }

    async fn lock_execution(&self, id: Uuid) -> Result<LockHandle> {
        let key = LockManager::key("execution-manager:execution", id);
        Ok(self
            .locks
            .acquire_with_retry(
                &key,
                self.config.lock_lease,
                self.config.lock_retry_attempts,
                self.config.lock_retry_delay,
            )
            .await?)
    }

    async fn release(&self, handle: LockHandle) {
        if let Err(e) = self.locks.release(handle).await {
            warn!(error = %e, "Could not release execution lock");
        }
    }

    fn ensure_valid(&self, handle: &LockHandle) -> Result<()> {
        if self.locks.is_valid(handle) {
            Ok(())
        } else {
            Err(Error::LeaseLost(handle.key().to_string()))
        }
    }

    async fn emit(
        &self,
        kind: ExecutionEventKind,
        execution: &Execution,
        stage: Option<&Stage>,
    ) -> Result<()> {
        match stage {
            Some(stage) => self
                .observers
                .streamer
                .publish(StatusUpdate::Stage(stage.clone())),
            None => {
                self.observers
                    .streamer
                    .publish(StatusUpdate::Execution(execution.clone()));
                self.observers.checks.report(execution).await;
            }
        }

        let event = ExecutionEvent {
            kind,
            execution: execution.clone(),
            stage_id: stage.map(|s| s.id),
        };
        self.bus
            .publish_json(
                streams::EXECUTION,
                &execution.pipeline_id.to_string(),
                &event,
            )
            .await?;
        Ok(())
    }

    async fn emit_stage(&self, execution: &Execution, stage: &Stage) -> Result<()> {
        self.emit(ExecutionEventKind::StageUpdated, execution, Some(stage))
            .await
    }
}

/// Once cancellation was requested nothing may report progress or success
fn coerce_for_cancel(status: StepStatus, canceling: bool) -> StepStatus {
    match status {
        StepStatus::Running | StepStatus::Success if canceling => StepStatus::Canceled,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::BusConfig;
    use crate::git::{MemoryCommit, MemoryGitProvider};

    const PIPELINE: &str = r#"
stages:
  - name: build
    steps:
      - { name: compile, commands: ["cargo build"] }
      - { name: test, commands: ["cargo test"] }
  - name: deploy
    depends_on: [build]
    steps:
      - { name: ship, commands: ["./ship.sh"] }
"#;

    struct Harness {
        manager: ExecutionManager,
        repos: Repositories,
        clock: Arc<ManualClock>,
        git: Arc<MemoryGitProvider>,
        pipeline_id: Uuid,
    }

    async fn harness(document: &str) -> Harness {
        let repos = Repositories::memory();
        let clock = Arc::new(ManualClock::default());
        let bus = EventBus::new(repos.events.clone(), clock.clone(), BusConfig::default());
        let locks = LockManager::new(repos.leases.clone(), clock.clone(), "test");
        let git = Arc::new(MemoryGitProvider::new());
        git.add_commit(
            "acme/api",
            "c0ffee",
            MemoryCommit {
                message: "feat: things".to_string(),
                files: HashMap::from([(".gantry/pipeline.yaml".to_string(), document.to_string())]),
                changed: vec![],
            },
        );
        git.set_ref("acme/api", "refs/heads/main", "c0ffee");

        let now = clock.now();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            repo_id: "acme/api".to_string(),
            uid: "ci".to_string(),
            description: None,
            config_path: ".gantry/pipeline.yaml".to_string(),
            default_branch: "main".to_string(),
            seq: 0,
            created_at: now,
            updated_at: now,
        };
        repos.pipelines.create(&pipeline).await.unwrap();

        let observers = Observers {
            streamer: Arc::new(Streamer::default()),
            logs: Arc::new(LogStream::default()),
            checks: Arc::new(CheckReporter::new(
                repos.checks.clone(),
                repos.pipelines.clone(),
                clock.clone(),
                "http://gantry.test",
            )),
        };
        let manager = ExecutionManager::new(
            &repos,
            locks,
            bus,
            git.clone(),
            clock.clone(),
            ExecutionConfig {
                max_poll_wait: Duration::ZERO,
                ..ExecutionConfig::default()
            },
            observers,
        );
        Harness {
            manager,
            repos,
            clock,
            git,
            pipeline_id: pipeline.id,
        }
    }

    fn report(runner: &str, status: StepStatus) -> StepReport {
        StepReport {
            runner_id: runner.to_string(),
            status,
            exit_code: None,
            error: None,
            log: vec![],
        }
    }

    async fn finish_stage(h: &Harness, stage_id: Uuid, runner: &str, status: StepStatus) {
        for step in h.repos.executions.list_steps(stage_id).await.unwrap() {
            h.manager
                .report_step(step.id, report(runner, StepStatus::Running))
                .await
                .unwrap();
            h.manager
                .report_step(step.id, report(runner, status))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_manual_run_flows_to_success() {
        let h = harness(PIPELINE).await;
        let execution = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        assert_eq!(execution.number, 1);
        assert_eq!(execution.refs.commit_sha, "c0ffee");

        let build = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
        assert_eq!(build.name, "build");
        assert!(h.manager.next_schedulable_stage("r2", &[]).await.unwrap().is_none());
        assert_eq!(h.manager.get(execution.id).await.unwrap().status, ExecutionStatus::Running);

        finish_stage(&h, build.id, "r1", StepStatus::Success).await;
        let deploy = h.manager.next_schedulable_stage("r2", &[]).await.unwrap().unwrap();
        assert_eq!(deploy.name, "deploy");
        finish_stage(&h, deploy.id, "r2", StepStatus::Success).await;

        let detail = h.manager.get_detail(execution.id).await.unwrap();
        assert_eq!(detail.execution.status, ExecutionStatus::Success);
        assert!(detail.stages.iter().all(|s| s.stage.status == StageStatus::Success));
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent() {
        let h = harness(PIPELINE).await;
        let execution = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();

        let build = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
        finish_stage(&h, build.id, "r1", StepStatus::Failure).await;

        let detail = h.manager.get_detail(execution.id).await.unwrap();
        assert_eq!(detail.stage("deploy").unwrap().stage.status, StageStatus::Skipped);
        assert!(detail.stage("deploy").unwrap().steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(detail.execution.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn test_invalid_document_is_rejected() {
        let h = harness("stages: [{ name: a, depends_on: [a], steps: [{ name: x }] }]").await;
        let err = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_labels_gate_claims() {
        let h = harness(
            "stages: [{ name: gpu, labels: [cuda], steps: [{ name: train, commands: [make] }] }]",
        )
        .await;
        h.manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();

        assert!(h.manager.next_schedulable_stage("cpu", &["linux".to_string()]).await.unwrap().is_none());
        let stage = h
            .manager
            .next_schedulable_stage("gpu", &["linux".to_string(), "cuda".to_string()])
            .await
            .unwrap();
        assert!(stage.is_some());
    }

    #[tokio::test]
    async fn test_unmatched_labels_do_not_hide_runnable_stages() {
        let h = harness(
            "stages: [{ name: gpu, labels: [cuda], steps: [{ name: train, commands: [make] }] }]",
        )
        .await;
        for _ in 0..100 {
            h.manager
                .run_manual(h.pipeline_id, RunPipeline::default())
                .await
                .unwrap();
        }

        h.git.add_commit(
            "acme/api",
            "beef",
            MemoryCommit {
                message: "chore: cpu only".to_string(),
                files: HashMap::from([(
                    ".gantry/pipeline.yaml".to_string(),
                    "stages: [{ name: lint, steps: [{ name: x, commands: [make] }] }]".to_string(),
                )]),
                changed: vec![],
            },
        );
        h.git.set_ref("acme/api", "refs/heads/cpu", "beef");
        h.clock.advance(Duration::from_secs(1));
        h.manager
            .run_manual(
                h.pipeline_id,
                RunPipeline {
                    branch: Some("cpu".to_string()),
                    ..RunPipeline::default()
                },
            )
            .await
            .unwrap();

        let stage = h.manager.next_schedulable_stage("cpu-runner", &[]).await.unwrap();
        assert_eq!(stage.map(|s| s.name).as_deref(), Some("lint"));
    }

    #[tokio::test]
    async fn test_claim_is_refused_once_execution_is_canceled() {
        let h = harness(PIPELINE).await;
        let execution = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        let build = h
            .repos
            .executions
            .list_stages(execution.id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.name == "build")
            .unwrap();

        let mut canceled = execution.clone();
        canceled.status = ExecutionStatus::Canceled;
        assert!(h
            .repos
            .executions
            .update(&canceled, &[ExecutionStatus::Pending])
            .await
            .unwrap());

        let now = h.clock.now();
        let claimed = h
            .repos
            .executions
            .claim_stage(build.id, "r1", now + chrono::Duration::seconds(60), now)
            .await
            .unwrap();
        assert!(claimed.is_none());
        let stored = h.repos.executions.find_stage(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StageStatus::Pending);
        assert!(stored.lease.is_none());
    }

    #[tokio::test]
    async fn test_report_from_replaced_runner_stores_no_logs() {
        let h = harness(PIPELINE).await;
        h.manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        let stage = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.manager.sweep_expired_leases().await.unwrap().reclaimed, 1);
        let again = h.manager.next_schedulable_stage("r2", &[]).await.unwrap().unwrap();
        assert_eq!(again.id, stage.id);

        let step = h.repos.executions.list_steps(stage.id).await.unwrap().remove(0);
        let mut stale = report("r1", StepStatus::Running);
        stale.log = vec![LogLine::system("stale output from r1")];
        let err = h.manager.report_step(step.id, stale).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
        assert!(h.repos.executions.list_logs(step.id).await.unwrap().is_empty());

        let mut current = report("r2", StepStatus::Running);
        current.log = vec![LogLine::system("output from r2")];
        h.manager.report_step(step.id, current).await.unwrap();
        let logs = h.repos.executions.list_logs(step.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "output from r2");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_then_errors() {
        let h = harness(PIPELINE).await;
        let execution = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();

        for round in 1..=3 {
            let stage = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
            assert_eq!(stage.name, "build");
            h.clock.advance(Duration::from_secs(61));
            let report = h.manager.sweep_expired_leases().await.unwrap();
            assert_eq!(report.reclaimed, 1, "round {}", round);
        }

        h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
        h.clock.advance(Duration::from_secs(61));
        let report = h.manager.sweep_expired_leases().await.unwrap();
        assert_eq!(report.errored, 1);

        let detail = h.manager.get_detail(execution.id).await.unwrap();
        assert_eq!(detail.stage("build").unwrap().stage.status, StageStatus::Error);
        assert_eq!(detail.stage("deploy").unwrap().stage.status, StageStatus::Skipped);
        assert_eq!(detail.execution.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_stage_and_rejects_strangers() {
        let h = harness(PIPELINE).await;
        h.manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        let stage = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();

        h.clock.advance(Duration::from_secs(45));
        let beat = h.manager.heartbeat(stage.id, "r1").await.unwrap();
        assert!(!beat.cancel);
        h.clock.advance(Duration::from_secs(45));
        assert_eq!(h.manager.sweep_expired_leases().await.unwrap(), SweepReport::default());

        let err = h.manager.heartbeat(stage.id, "r2").await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_rest_and_stops_siblings() {
        let h = harness(
            r#"
fail_fast: true
stages:
  - { name: a, steps: [{ name: x, commands: [make] }] }
  - { name: b, steps: [{ name: x, commands: [make] }] }
  - { name: c, depends_on: [a, b], steps: [{ name: x, commands: [make] }] }
"#,
        )
        .await;
        let execution = h
            .manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        let a = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();
        let b = h.manager.next_schedulable_stage("r2", &[]).await.unwrap().unwrap();

        finish_stage(&h, a.id, "r1", StepStatus::Failure).await;
        let beat = h.manager.heartbeat(b.id, "r2").await.unwrap();
        assert!(beat.cancel);

        // The sibling's late success is recorded as canceled
        finish_stage(&h, b.id, "r2", StepStatus::Success).await;
        let detail = h.manager.get_detail(execution.id).await.unwrap();
        assert_eq!(detail.stage_by_id(b.id).unwrap().stage.status, StageStatus::Canceled);
        assert_eq!(detail.stage("c").unwrap().stage.status, StageStatus::Skipped);
        assert_eq!(detail.execution.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn test_fetch_stage_exposes_env_and_secrets() {
        let h = harness(
            r#"
stages:
  - name: release
    steps:
      - { name: a, commands: [make], secrets: [NPM_TOKEN] }
      - { name: b, commands: [make], secrets: [NPM_TOKEN, GH_TOKEN] }
"#,
        )
        .await;
        h.manager
            .run_manual(h.pipeline_id, RunPipeline::default())
            .await
            .unwrap();
        let stage = h.manager.next_schedulable_stage("r1", &[]).await.unwrap().unwrap();

        let def = h.manager.fetch_stage(stage.id).await.unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.secrets, vec!["GH_TOKEN", "NPM_TOKEN"]);
        assert_eq!(def.env["GANTRY_COMMIT_SHA"], "c0ffee");
        assert_eq!(def.env["GANTRY_STAGE"], "release");
    }
}
