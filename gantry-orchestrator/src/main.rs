use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_orchestrator::api;
use gantry_orchestrator::app::App;
use gantry_orchestrator::clock::SystemClock;
use gantry_orchestrator::config::{Cli, StoreKind};
use gantry_orchestrator::db;
use gantry_orchestrator::git::LocalGitProvider;
use gantry_orchestrator::repository::Repositories;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config();
    config.validate().context("Invalid configuration")?;

    tracing::info!("Starting Gantry Orchestrator ({})...", config.instance_id);

    let repos = match config.store {
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Repositories::memory()
        }
        StoreKind::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required with the postgres store")?;

            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Repositories::postgres(pool)
        }
    };

    let git = Arc::new(LocalGitProvider::new(config.git_root.clone()));
    let addr = config.bind_addr.clone();
    let app = App::build(config, repos, git, Arc::new(SystemClock))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = app.start_workers(shutdown_rx).await?;

    // Build router with all API endpoints
    let router = api::create_router(app);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down background workers...");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("Gantry Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
