//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod events;
pub mod execution;
pub mod health;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::app::App;

/// Create the main API router with all endpoints
pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Runner protocol
        .route("/api/runner/poll", post(runner::poll))
        .route("/api/runner/stages/{id}", get(runner::fetch_stage))
        .route("/api/runner/stages/{id}/heartbeat", post(runner::heartbeat))
        .route("/api/runner/steps/{id}", post(runner::report_step))
        .route("/api/runners", get(runner::list_runners))
        // Pipeline endpoints
        .route(
            "/api/pipelines",
            post(pipeline::create_pipeline).get(pipeline::list_pipelines),
        )
        .route(
            "/api/pipelines/{id}",
            get(pipeline::get_pipeline).delete(pipeline::delete_pipeline),
        )
        .route(
            "/api/pipelines/{id}/triggers",
            post(pipeline::create_trigger).get(pipeline::list_triggers),
        )
        .route("/api/pipelines/{id}/schedule", post(pipeline::schedule))
        .route("/api/triggers/{id}/enable", post(pipeline::enable_trigger))
        .route("/api/triggers/{id}/disable", post(pipeline::disable_trigger))
        .route("/api/checks", get(pipeline::list_checks))
        // Execution endpoints
        .route(
            "/api/pipelines/{id}/executions",
            post(execution::run_pipeline).get(execution::list_executions),
        )
        .route("/api/executions/{id}", get(execution::get_execution))
        .route("/api/executions/{id}/cancel", post(execution::cancel_execution))
        .route("/api/executions/{id}/events", get(execution::stream_execution))
        .route("/api/steps/{id}/logs", get(execution::get_step_logs))
        .route("/api/steps/{id}/logs/stream", get(execution::stream_step_logs))
        // Webhook endpoints
        .route(
            "/api/webhooks",
            post(webhook::create_webhook).get(webhook::list_webhooks),
        )
        .route(
            "/api/webhooks/{id}",
            get(webhook::get_webhook)
                .put(webhook::update_webhook)
                .delete(webhook::delete_webhook),
        )
        .route("/api/webhooks/{id}/deliveries", get(webhook::list_deliveries))
        .route("/api/deliveries/{id}/retrigger", post(webhook::retrigger_delivery))
        // Event ingestion
        .route("/api/events/git", post(events::publish_git_event))
        .route("/api/events/pullreq", post(events::publish_pullreq_event))
        // Job queue
        .route("/api/jobs", get(job::list_jobs))
        .route("/api/jobs/{id}", get(job::get_job))
        // Add state and middleware
        .with_state(app)
        .layer(TraceLayer::new_for_http())
}
