//! Stage poller
//!
//! Asks for work only while a slot is free, so a claimed stage never waits
//! on this runner's own capacity before its lease starts ticking.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use gantry_client::OrchestratorClient;

use crate::config::Config;
use crate::service::StageRunner;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Polls for stages and executes them
pub struct StagePoller {
    config: Config,
    client: Arc<OrchestratorClient>,
    runner: Arc<StageRunner>,
    semaphore: Arc<Semaphore>,
}

impl StagePoller {
    pub fn new(config: Config, client: Arc<OrchestratorClient>, runner: Arc<StageRunner>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_stages));
        Self {
            config,
            client,
            runner,
            semaphore,
        }
    }

    /// Polls until shutdown, then waits for running stages to finish
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting stage poller (poll timeout: {:?}, parallel stages: {})",
            self.config.poll_timeout, self.config.max_parallel_stages
        );
        let mut backoff = MIN_BACKOFF;

        loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => permit?,
                _ = shutdown.changed() => break,
            };

            let polled = tokio::select! {
                polled = self.client.poll(
                    &self.config.runner_id,
                    &self.config.labels,
                    self.config.poll_timeout,
                ) => polled,
                _ = shutdown.changed() => break,
            };

            match polled {
                Ok(Some(assignment)) => {
                    backoff = MIN_BACKOFF;
                    info!(
                        "Claimed stage {} of execution {}",
                        assignment.stage_id, assignment.execution_id
                    );
                    let runner = self.runner.clone();
                    tokio::spawn(async move {
                        let stage_id = assignment.stage_id;
                        if let Err(e) = runner.run(assignment).await {
                            error!("Stage {} failed on this runner: {:#}", stage_id, e);
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    backoff = MIN_BACKOFF;
                    debug!("No stage available");
                    if self.config.poll_timeout.is_zero() {
                        // Short polling; do not spin
                        time::sleep(MIN_BACKOFF).await;
                    }
                }
                Err(e) => {
                    warn!("Poll failed: {}; retrying in {:?}", e, backoff);
                    drop(permit);
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!("Waiting for running stages to finish");
        let all = self.config.max_parallel_stages as u32;
        let _ = self.semaphore.acquire_many(all).await?;
        info!("Stage poller stopped");
        Ok(())
    }
}
