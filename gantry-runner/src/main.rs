//! Gantry Runner
//!
//! A stateless worker that executes pipeline stages claimed from the
//! orchestrator.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Services: Step execution, log buffering, per-stage lifecycle
//! - Scheduler: Long-polling and bounded parallel stage execution
//!
//! Each claimed stage runs its steps in order as shell commands, on the host
//! or inside a podman container, while a heartbeat keeps the lease alive and
//! relays cancellation.

mod config;
mod podman;
mod scheduler;
mod service;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::StagePoller;
use crate::service::{ShellExecutor, StageRunner};
use gantry_client::OrchestratorClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: runner_id={}, orchestrator_url={}, labels={:?}",
        config.runner_id, config.orchestrator_url, config.labels
    );

    // No overall timeout: polls set their own from the requested wait
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let client = Arc::new(OrchestratorClient::with_client(
        config.orchestrator_url.clone(),
        http,
    ));
    wait_for_orchestrator(&client).await?;

    if let Err(e) = podman::check_podman_available().await {
        warn!("Steps with an image will fail on this runner: {:#}", e);
    }

    let runner = Arc::new(StageRunner::new(
        config.clone(),
        client.clone(),
        Arc::new(ShellExecutor),
    ));
    let poller = StagePoller::new(config, client, runner);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = poller.run(shutdown_rx).await {
        error!("Poller error: {:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            info!("Incomplete environment ({}), using defaults", e);
            Config::default()
        }
    };
    config.validate()?;
    Ok(config)
}

/// Waits for the orchestrator with exponential backoff
///
/// The orchestrator may not be ready yet when the runner starts, which is
/// common in container environments.
async fn wait_for_orchestrator(client: &OrchestratorClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;
        match client.health().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Orchestrator reachable after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) if attempt >= MAX_RETRIES => {
                return Err(anyhow::anyhow!(
                    "Orchestrator unreachable after {} attempts: {}",
                    MAX_RETRIES,
                    e
                ));
            }
            Err(e) => {
                warn!(
                    "Orchestrator not reachable (attempt {}/{}): {}; retrying in {} ms",
                    attempt, MAX_RETRIES, e, delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
