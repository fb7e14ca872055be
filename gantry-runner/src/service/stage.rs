//! Stage runner
//!
//! Carries one claimed stage from definition fetch to final step report.
//! A heartbeat task keeps the lease alive and turns a cancel signal, or the
//! loss of the lease, into the cancellation flag every step observes.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_client::OrchestratorClient;
use gantry_core::domain::execution::{Step, StepStatus};
use gantry_core::domain::log::LogLine;
use gantry_core::dto::runner::{StageAssignment, StepReport};

use crate::config::Config;
use crate::podman::{CONTAINER_WORKSPACE, ContainerManager};
use crate::service::executor::{StepContext, StepExecutor, StepOutcome};
use crate::service::log_buffer::LogBuffer;

/// Runs claimed stages
pub struct StageRunner {
    config: Config,
    client: Arc<OrchestratorClient>,
    executor: Arc<dyn StepExecutor>,
}

/// Cancellation state shared by the heartbeat, log sender and steps
struct Signals {
    cancel: watch::Sender<bool>,
    /// The orchestrator no longer accepts reports from this runner
    lease_lost: AtomicBool,
}

impl Signals {
    fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn lose_lease(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
        self.cancel();
    }

    fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }
}

impl StageRunner {
    pub fn new(
        config: Config,
        client: Arc<OrchestratorClient>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            config,
            client,
            executor,
        }
    }

    /// Runs every step of the stage and reports their outcomes
    pub async fn run(&self, assignment: StageAssignment) -> Result<()> {
        let stage_id = assignment.stage_id;
        let definition = self
            .client
            .fetch_stage(stage_id)
            .await
            .context("Failed to fetch stage definition")?;
        info!(
            "Running stage {} ({} steps) of execution {}",
            definition.stage.name,
            definition.steps.len(),
            assignment.execution_id
        );

        let workspace = self.config.workspace_base.join(stage_id.to_string());
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let signals = Arc::new(Signals {
            cancel: cancel_tx,
            lease_lost: AtomicBool::new(false),
        });
        let heartbeat = self.spawn_heartbeat(stage_id, signals.clone());
        let containers = Arc::new(ContainerManager::new(stage_id, &workspace));

        let mut env = definition.env.clone();
        env.extend(resolve_secrets(&definition.secrets));

        let mut steps = definition.steps;
        steps.sort_by_key(|s| s.number);

        let mut failed = false;
        for step in &steps {
            if signals.lease_lost() {
                warn!("Lease on stage {} lost; abandoning remaining steps", stage_id);
                break;
            }
            if step.status.is_terminal() {
                // Already settled, e.g. before this runner reclaimed the stage
                failed |= matches!(step.status, StepStatus::Failure | StepStatus::Error);
                continue;
            }

            let (outcome, log) = if signals.is_canceled() {
                (StepOutcome::without_run(StepStatus::Canceled), Vec::new())
            } else if failed {
                (StepOutcome::without_run(StepStatus::Skipped), Vec::new())
            } else {
                let mut step_env = env.clone();
                step_env.extend(step.env.clone());
                let workspace_var = if step.image.is_some() {
                    CONTAINER_WORKSPACE.to_string()
                } else {
                    workspace.display().to_string()
                };
                step_env.insert("GANTRY_WORKSPACE".to_string(), workspace_var);
                step_env.insert("GANTRY_STEP".to_string(), step.name.clone());

                let ctx = StepContext {
                    env: step_env,
                    logs: LogBuffer::new(),
                    cancel: cancel_rx.clone(),
                    timeout: self.config.step_timeout,
                    containers: containers.clone(),
                };
                self.execute_step(step, &ctx, &signals).await
            };

            info!("Step {} finished: {}", step.name, outcome.status);
            failed |= matches!(outcome.status, StepStatus::Failure | StepStatus::Error);
            self.finish_step(step, outcome, log, &signals).await;
        }

        heartbeat.abort();
        containers.cleanup().await;
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            debug!("Failed to remove workspace {}: {}", workspace.display(), e);
        }
        info!("Stage {} done", definition.stage.name);
        Ok(())
    }

    /// Runs one step; returns its outcome and the output not yet sent
    async fn execute_step(
        &self,
        step: &Step,
        ctx: &StepContext,
        signals: &Arc<Signals>,
    ) -> (StepOutcome, Vec<LogLine>) {
        info!("Starting step {}", step.name);
        ctx.logs.system(format!("Starting step {}", step.name));
        let report = StepReport {
            runner_id: self.config.runner_id.clone(),
            status: StepStatus::Running,
            exit_code: None,
            error: None,
            log: ctx.logs.drain(),
        };
        self.report(step.id, &report, signals).await;

        let (stop, stopped) = oneshot::channel();
        let sender = self.spawn_log_sender(step.id, ctx.logs.clone(), signals.clone(), stopped);
        let mut outcome = self.executor.run(step, ctx).await;
        let _ = stop.send(());
        if let Err(e) = sender.await {
            warn!("Log sender for step {} panicked: {}", step.id, e);
        }

        // A cancel that arrived after the last command still wins
        if signals.is_canceled() && outcome.status == StepStatus::Success {
            outcome.status = StepStatus::Canceled;
        }
        (outcome, ctx.logs.drain())
    }

    async fn finish_step(
        &self,
        step: &Step,
        outcome: StepOutcome,
        log: Vec<LogLine>,
        signals: &Signals,
    ) {
        let report = StepReport {
            runner_id: self.config.runner_id.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            error: outcome.error,
            log,
        };
        self.report(step.id, &report, signals).await;
    }

    async fn report(&self, step_id: Uuid, report: &StepReport, signals: &Signals) {
        if signals.lease_lost() {
            return;
        }
        match self.client.report_step(step_id, report).await {
            Ok(ack) => {
                if ack.cancel {
                    signals.cancel();
                }
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!("Report for step {} rejected: {}", step_id, e);
                signals.lose_lease();
            }
            Err(e) => error!("Failed to report step {}: {}", step_id, e),
        }
    }

    /// Sends buffered output at the configured interval until stopped
    fn spawn_log_sender(
        &self,
        step_id: Uuid,
        logs: LogBuffer,
        signals: Arc<Signals>,
        mut stop: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let runner_id = self.config.runner_id.clone();
        let interval = self.config.log_send_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop => return,
                }
                let lines = logs.drain();
                if lines.is_empty() || signals.lease_lost() {
                    continue;
                }
                debug!("Sending {} log lines for step {}", lines.len(), step_id);
                match client.send_logs(step_id, &runner_id, lines).await {
                    Ok(ack) if ack.cancel => signals.cancel(),
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => signals.lose_lease(),
                    Err(e) => warn!("Failed to send logs for step {}: {}", step_id, e),
                }
            }
        })
    }

    /// Renews the stage lease until aborted
    fn spawn_heartbeat(&self, stage_id: Uuid, signals: Arc<Signals>) -> JoinHandle<()> {
        let client = self.client.clone();
        let runner_id = self.config.runner_id.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                match client.heartbeat(stage_id, &runner_id).await {
                    Ok(beat) if beat.cancel => {
                        if !signals.is_canceled() {
                            info!("Cancel requested for stage {}", stage_id);
                        }
                        signals.cancel();
                    }
                    Ok(_) => {}
                    Err(e) if e.is_conflict() || e.is_not_found() => {
                        warn!("Lost lease on stage {}: {}", stage_id, e);
                        signals.lose_lease();
                        return;
                    }
                    Err(e) => warn!("Heartbeat for stage {} failed: {}", stage_id, e),
                }
            }
        })
    }
}

/// Secret values come from the runner's own environment under the same name
fn resolve_secrets(names: &[String]) -> HashMap<String, String> {
    names
        .iter()
        .filter_map(|name| match std::env::var(name) {
            Ok(value) => Some((name.clone(), value)),
            Err(_) => {
                warn!("Secret {} is not available on this runner", name);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, State},
        routing::{get, post},
    };
    use chrono::Utc;
    use gantry_core::domain::execution::{Stage, StageStatus};
    use gantry_core::dto::runner::{HeartbeatResponse, StageDefinition, StepAck};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::service::executor::ShellExecutor;

    /// Orchestrator double serving one stage and recording step reports
    #[derive(Clone)]
    struct Fake {
        definition: Arc<StageDefinition>,
        cancel: Arc<AtomicBool>,
        reports: Arc<Mutex<Vec<(Uuid, StepReport)>>>,
    }

    async fn fetch(State(fake): State<Fake>) -> Json<StageDefinition> {
        Json((*fake.definition).clone())
    }

    async fn heartbeat(State(fake): State<Fake>) -> Json<HeartbeatResponse> {
        Json(HeartbeatResponse {
            lease_expires_at: Utc::now(),
            cancel: fake.cancel.load(Ordering::SeqCst),
        })
    }

    async fn report(
        State(fake): State<Fake>,
        Path(step_id): Path<Uuid>,
        Json(report): Json<StepReport>,
    ) -> Json<StepAck> {
        let recorded = report.status;
        fake.reports.lock().unwrap().push((step_id, report));
        Json(StepAck {
            recorded,
            cancel: fake.cancel.load(Ordering::SeqCst),
        })
    }

    fn definition(steps: &[&[&str]]) -> StageDefinition {
        let stage_id = Uuid::new_v4();
        let execution_id = Uuid::new_v4();
        let now = Utc::now();
        StageDefinition {
            stage: Stage {
                id: stage_id,
                execution_id,
                number: 0,
                name: "build".to_string(),
                depends_on: vec![],
                labels: vec![],
                status: StageStatus::Running,
                lease: None,
                reclaims: 0,
                cancel_requested: false,
                fail_fast: false,
                error: None,
                started_at: Some(now),
                finished_at: None,
                updated_at: now,
            },
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, commands)| Step {
                    id: Uuid::new_v4(),
                    stage_id,
                    execution_id,
                    number: i as i32,
                    name: format!("step-{}", i),
                    image: None,
                    commands: commands.iter().map(|c| c.to_string()).collect(),
                    env: HashMap::new(),
                    secrets: vec![],
                    status: StepStatus::Pending,
                    exit_code: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            env: HashMap::from([("TARGET".to_string(), "prod".to_string())]),
            secrets: vec![],
        }
    }

    async fn start(definition: StageDefinition) -> (Fake, StageRunner, tempfile::TempDir) {
        let fake = Fake {
            definition: Arc::new(definition),
            cancel: Arc::new(AtomicBool::new(false)),
            reports: Arc::new(Mutex::new(Vec::new())),
        };
        let router = Router::new()
            .route("/api/runner/stages/{id}", get(fetch))
            .route("/api/runner/stages/{id}/heartbeat", post(heartbeat))
            .route("/api/runner/steps/{id}", post(report))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("r1".to_string(), format!("http://{}", addr));
        config.workspace_base = dir.path().to_path_buf();
        config.heartbeat_interval = Duration::from_millis(20);
        config.log_send_interval = Duration::from_millis(20);

        let runner = StageRunner::new(
            config,
            Arc::new(OrchestratorClient::new(format!("http://{}", addr))),
            Arc::new(ShellExecutor),
        );
        (fake, runner, dir)
    }

    fn assignment(fake: &Fake) -> StageAssignment {
        StageAssignment {
            stage_id: fake.definition.stage.id,
            execution_id: fake.definition.stage.execution_id,
            lease_expires_at: Utc::now(),
        }
    }

    /// Final status reported for each step, in step order
    fn final_statuses(fake: &Fake) -> Vec<StepStatus> {
        let reports = fake.reports.lock().unwrap();
        fake.definition
            .steps
            .iter()
            .map(|step| {
                reports
                    .iter()
                    .filter(|(id, _)| *id == step.id)
                    .map(|(_, r)| r.status)
                    .filter(|s| s.is_terminal())
                    .last()
                    .unwrap_or(StepStatus::Pending)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failed_step_skips_the_rest() {
        let (fake, runner, dir) =
            start(definition(&[&["echo $TARGET"], &["exit 4"], &["echo never"]])).await;

        runner.run(assignment(&fake)).await.unwrap();

        assert_eq!(
            final_statuses(&fake),
            vec![StepStatus::Success, StepStatus::Failure, StepStatus::Skipped]
        );
        let reports = fake.reports.lock().unwrap();
        let failure = reports
            .iter()
            .find(|(_, r)| r.status == StepStatus::Failure)
            .unwrap();
        assert_eq!(failure.1.exit_code, Some(4));
        let output: Vec<_> = reports
            .iter()
            .flat_map(|(_, r)| r.log.iter().map(|l| l.message.clone()))
            .collect();
        assert!(output.contains(&"prod".to_string()));
        assert!(!output.contains(&"never".to_string()));
        // Workspace is removed afterwards
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_signal_stops_the_stage() {
        let (fake, runner, _dir) =
            start(definition(&[&["exec sleep 30"], &["echo never"]])).await;

        let cancel = fake.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.store(true, Ordering::SeqCst);
        });
        tokio::time::timeout(Duration::from_secs(10), runner.run(assignment(&fake)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            final_statuses(&fake),
            vec![StepStatus::Canceled, StepStatus::Canceled]
        );
    }
}
