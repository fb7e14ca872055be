//! Application wiring
//!
//! Builds every component in dependency order, leaves first, and starts the
//! background workers.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use gantry_core::domain::event::streams;

use crate::bus::EventBus;
use crate::bus::consumer::{Consumer, EventHandler};
use crate::canceler::Canceler;
use crate::clock::SharedClock;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::execution::{ExecutionManager, Observers};
use crate::git::GitProvider;
use crate::lock::LockManager;
use crate::repository::Repositories;
use crate::scheduler::JobScheduler;
use crate::scheduler::maintenance;
use crate::service::check::CheckReporter;
use crate::service::pipeline::PipelineService;
use crate::service::runner::RunnerService;
use crate::service::stream::{LogStream, Streamer};
use crate::trigger::TriggerEngine;
use crate::webhook::WebhookService;
use crate::webhook::dispatcher::WebhookDispatcher;

/// Shared application context handed to the HTTP layer and the workers
pub struct App {
    pub config: OrchestratorConfig,
    pub repos: Repositories,
    pub clock: SharedClock,
    pub bus: EventBus,
    pub locks: LockManager,
    pub streamer: Arc<Streamer>,
    pub logs: Arc<LogStream>,
    pub checks: Arc<CheckReporter>,
    pub executions: Arc<ExecutionManager>,
    pub canceler: Arc<Canceler>,
    pub triggers: Arc<TriggerEngine>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub webhooks: WebhookService,
    pub scheduler: Arc<JobScheduler>,
    pub pipelines: PipelineService,
    pub runners: RunnerService,
}

impl App {
    pub fn build(
        config: OrchestratorConfig,
        repos: Repositories,
        git: Arc<dyn GitProvider>,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let bus = EventBus::new(repos.events.clone(), clock.clone(), config.bus.clone());
        let locks = LockManager::new(repos.leases.clone(), clock.clone(), config.instance_id.clone());

        let streamer = Arc::new(Streamer::default());
        let logs = Arc::new(LogStream::default());
        let checks = Arc::new(CheckReporter::new(
            repos.checks.clone(),
            repos.pipelines.clone(),
            clock.clone(),
            config.public_url.clone(),
        ));

        let executions = Arc::new(ExecutionManager::new(
            &repos,
            locks.clone(),
            bus.clone(),
            git.clone(),
            clock.clone(),
            config.execution.clone(),
            Observers {
                streamer: streamer.clone(),
                logs: logs.clone(),
                checks: checks.clone(),
            },
        ));

        let canceler = Arc::new(Canceler::new(
            executions.clone(),
            bus.clone(),
            config.canceler.clone(),
        ));

        let triggers = Arc::new(TriggerEngine::new(
            repos.pipelines.clone(),
            repos.triggers.clone(),
            executions.clone(),
            canceler.clone(),
            git,
            clock.clone(),
            config.trigger.clone(),
        ));

        let dispatcher = Arc::new(WebhookDispatcher::new(
            repos.webhooks.clone(),
            locks.clone(),
            clock.clone(),
            config.webhook.clone(),
        )?);
        let webhooks = WebhookService::new(
            repos.webhooks.clone(),
            repos.pipelines.clone(),
            dispatcher.clone(),
            clock.clone(),
            config.webhook.clone(),
        );

        let mut scheduler = JobScheduler::new(
            repos.jobs.clone(),
            locks.clone(),
            bus.clone(),
            clock.clone(),
            config.scheduler.clone(),
            config.instance_id.clone(),
        );
        for (kind, handler) in maintenance::handlers(
            &repos,
            executions.clone(),
            bus.clone(),
            clock.clone(),
            &config.maintenance,
        ) {
            scheduler = scheduler.with_handler(kind, handler);
        }

        let pipelines = PipelineService::new(
            repos.pipelines.clone(),
            repos.triggers.clone(),
            clock.clone(),
        );
        let runners = RunnerService::new(
            repos.runners.clone(),
            clock.clone(),
            chrono::Duration::seconds((config.execution.max_poll_wait.as_secs() as i64 * 4).max(60)),
        );

        Ok(Arc::new(Self {
            config,
            repos,
            clock,
            bus,
            locks,
            streamer,
            logs,
            checks,
            executions,
            canceler,
            triggers,
            dispatcher,
            webhooks,
            scheduler: Arc::new(scheduler),
            pipelines,
            runners,
        }))
    }

    /// One consumer per (stream, group) pair
    pub fn consumers(&self) -> Vec<Consumer> {
        let triggers: Arc<dyn EventHandler> = self.triggers.clone();
        let dispatcher: Arc<dyn EventHandler> = self.dispatcher.clone();
        let canceler: Arc<dyn EventHandler> = self.canceler.clone();

        let pairs = [
            (streams::GIT, triggers.clone()),
            (streams::PULLREQ, triggers),
            (streams::GIT, dispatcher.clone()),
            (streams::PULLREQ, dispatcher.clone()),
            (streams::EXECUTION, dispatcher),
            (streams::EXECUTION_CANCEL, canceler),
        ];
        pairs
            .into_iter()
            .map(|(stream, handler)| {
                Consumer::new(self.bus.clone(), self.locks.clone(), stream, handler)
            })
            .collect()
    }

    /// Registers the recurring jobs and starts consumers, webhook retries
    /// and the scheduler
    pub async fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        maintenance::register_maintenance(&self.scheduler, &self.config.maintenance).await?;

        let mut workers = Vec::new();
        for consumer in self.consumers() {
            workers.push(tokio::spawn(consumer.run(shutdown.clone())));
        }
        let dispatcher = self.dispatcher.clone();
        let retries = shutdown.clone();
        workers.push(tokio::spawn(async move { dispatcher.run_retries(retries).await }));
        let scheduler = self.scheduler.clone();
        workers.push(tokio::spawn(async move { scheduler.run(shutdown).await }));

        info!(workers = workers.len(), "Background workers started");
        Ok(workers)
    }

    /// Processes every pending event on every consumer until all streams
    /// are drained. Returns the number of events handled.
    pub async fn drain_events(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut round = 0;
            for consumer in self.consumers() {
                round += consumer.run_until_idle().await?;
            }
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
    }
}
