//! Built-in recurring jobs
//!
//! Housekeeping that must run exactly once per tick across all instances,
//! plus cron-scheduled pipeline runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use gantry_core::domain::event::{MetricsSnapshot, streams};
use gantry_core::domain::job::JobSchedule;
use gantry_core::dto::execution::RunPipeline;

use super::{Enqueued, JobContext, JobHandler, JobScheduler};
use crate::bus::EventBus;
use crate::clock::{SharedClock, to_chrono};
use crate::config::MaintenanceConfig;
use crate::error::{Error, Result};
use crate::execution::ExecutionManager;
use crate::repository::Repositories;

pub const LEASE_SWEEP: &str = "execution.lease-sweep";
pub const LOG_CLEANUP: &str = "logs.cleanup";
pub const METRICS: &str = "metrics.collect";
pub const WEBHOOK_PRUNE: &str = "webhook.history-prune";
pub const PIPELINE_CRON: &str = "pipeline.cron";

/// Registers the housekeeping jobs; already registered ones are kept
pub async fn register_maintenance(scheduler: &JobScheduler, config: &MaintenanceConfig) -> Result<()> {
    let jobs = [
        (LEASE_SWEEP, config.sweep_interval),
        (LOG_CLEANUP, config.cleanup_interval),
        (METRICS, config.metrics_interval),
        (WEBHOOK_PRUNE, config.cleanup_interval),
    ];
    for (kind, every) in jobs {
        scheduler
            .register_recurring(kind, kind, interval(every), json!({}))
            .await?;
    }
    Ok(())
}

fn interval(every: Duration) -> JobSchedule {
    JobSchedule::Interval {
        seconds: every.as_secs().max(1),
    }
}

/// Handlers for every built-in job kind
pub fn handlers(
    repos: &Repositories,
    executions: Arc<ExecutionManager>,
    bus: EventBus,
    clock: SharedClock,
    config: &MaintenanceConfig,
) -> Vec<(&'static str, Arc<dyn JobHandler>)> {
    vec![
        (
            LEASE_SWEEP,
            Arc::new(LeaseSweepJob {
                executions: executions.clone(),
            }),
        ),
        (
            LOG_CLEANUP,
            Arc::new(LogCleanupJob {
                repos: repos.clone(),
                clock: clock.clone(),
                retention: config.log_retention,
            }),
        ),
        (
            WEBHOOK_PRUNE,
            Arc::new(WebhookPruneJob {
                repos: repos.clone(),
                clock: clock.clone(),
                retention: config.webhook_retention,
            }),
        ),
        (
            METRICS,
            Arc::new(MetricsJob {
                repos: repos.clone(),
                bus,
                clock,
            }),
        ),
        (PIPELINE_CRON, Arc::new(PipelineCronJob { executions })),
    ]
}

// =============================================================================
// Housekeeping
// =============================================================================

pub struct LeaseSweepJob {
    executions: Arc<ExecutionManager>,
}

#[async_trait]
impl JobHandler for LeaseSweepJob {
    async fn run(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
        let report = self.executions.sweep_expired_leases().await?;
        Ok(json!({
            "reclaimed": report.reclaimed,
            "errored": report.errored,
            "canceled": report.canceled,
        }))
    }
}

/// Drops step logs older than the retention window
pub struct LogCleanupJob {
    repos: Repositories,
    clock: SharedClock,
    retention: Duration,
}

#[async_trait]
impl JobHandler for LogCleanupJob {
    async fn run(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
        let cutoff = self.clock.now() - to_chrono(self.retention);
        let deleted = self.repos.executions.delete_logs_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "Old step logs removed");
        }
        Ok(json!({ "deleted": deleted }))
    }
}

/// Drops whole delivery records older than the retention window
pub struct WebhookPruneJob {
    repos: Repositories,
    clock: SharedClock,
    retention: Duration,
}

#[async_trait]
impl JobHandler for WebhookPruneJob {
    async fn run(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
        let cutoff = self.clock.now() - to_chrono(self.retention);
        let deleted = self.repos.webhooks.delete_deliveries_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "Old webhook deliveries removed");
        }
        Ok(json!({ "deleted": deleted }))
    }
}

/// Publishes `metrics.collected` on the `metrics` stream
pub struct MetricsJob {
    repos: Repositories,
    bus: EventBus,
    clock: SharedClock,
}

impl MetricsJob {
    async fn collect(&self) -> Result<MetricsSnapshot> {
        let pipelines = self.repos.pipelines.list_all().await?.len() as u64;
        let executions: BTreeMap<String, u64> = self
            .repos
            .executions
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        let runners = self.repos.runners.list_all().await?.len() as u64;
        Ok(MetricsSnapshot {
            pipelines,
            executions,
            runners,
            collected_at: self.clock.now(),
        })
    }
}

#[async_trait]
impl JobHandler for MetricsJob {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let snapshot = self.collect().await?;
        ctx.progress(50, "collected").await?;
        self.bus
            .publish_json(streams::METRICS, "metrics.collected", &snapshot)
            .await?;
        Ok(serde_json::to_value(&snapshot)?)
    }
}

// =============================================================================
// Cron pipelines
// =============================================================================

/// Payload of a `pipeline.cron` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronRun {
    pub pipeline_id: Uuid,
    /// The pipeline's default branch when absent
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Schedules a pipeline on a cron expression (seconds field included)
pub async fn schedule_pipeline(
    scheduler: &JobScheduler,
    expression: &str,
    run: CronRun,
) -> Result<(String, Enqueued)> {
    let id = format!("{}:{}", PIPELINE_CRON, run.pipeline_id);
    let schedule = JobSchedule::Cron {
        expression: expression.to_string(),
    };
    let enqueued = scheduler
        .register_recurring(&id, PIPELINE_CRON, schedule, serde_json::to_value(&run)?)
        .await?;
    Ok((id, enqueued))
}

pub struct PipelineCronJob {
    executions: Arc<ExecutionManager>,
}

#[async_trait]
impl JobHandler for PipelineCronJob {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let run: CronRun = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| Error::Validation(format!("invalid cron payload: {}", e)))?;
        let key = format!("cron:{}:{}", ctx.job_id, ctx.scheduled_for.timestamp());

        let created = self
            .executions
            .run_scheduled(
                run.pipeline_id,
                RunPipeline {
                    branch: run.branch,
                    params: run.params,
                    triggered_by: Some(ctx.job_id.clone()),
                },
                key,
            )
            .await?;
        let execution = created.execution();
        Ok(json!({
            "execution_id": execution.id,
            "number": execution.number,
            "duplicate": !created.is_new(),
        }))
    }
}
