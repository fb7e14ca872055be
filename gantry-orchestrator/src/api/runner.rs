//! Runner API Handlers
//!
//! The runner protocol: long-poll for a stage, keep its lease alive, fetch
//! its definition and report step progress.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use gantry_core::dto::runner::{
    HeartbeatRequest, HeartbeatResponse, PollRequest, RunnerInfo, StageDefinition, StepAck,
    StepReport,
};

use crate::api::error::{ApiError, ApiResult};
use crate::app::App;

// =============================================================================
// Runner Protocol
// =============================================================================

/// POST /api/runner/poll
/// Claim the next runnable stage; 204 when nothing became runnable in time
pub async fn poll(State(app): State<Arc<App>>, Json(req): Json<PollRequest>) -> ApiResult<Response> {
    validate_runner_id(&req.runner_id)?;
    tracing::debug!("Poll from runner {} (labels: {:?})", req.runner_id, req.labels);

    match app.executions.poll(&req).await? {
        Some(assignment) => {
            tracing::info!(
                "Stage {} assigned to runner {}",
                assignment.stage_id,
                req.runner_id
            );
            Ok(Json(assignment).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/runner/stages/{id}/heartbeat
/// Renew the stage lease; the answer carries the cancel signal
pub async fn heartbeat(
    State(app): State<Arc<App>>,
    Path(stage_id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    validate_runner_id(&req.runner_id)?;
    tracing::debug!("Heartbeat for stage {} from {}", stage_id, req.runner_id);

    let response = app.executions.heartbeat(stage_id, &req.runner_id).await?;
    Ok(Json(response))
}

/// GET /api/runner/stages/{id}
/// Stage definition with its steps, environment and secret names
pub async fn fetch_stage(
    State(app): State<Arc<App>>,
    Path(stage_id): Path<Uuid>,
) -> ApiResult<Json<StageDefinition>> {
    tracing::debug!("Fetching stage definition: {}", stage_id);

    let definition = app.executions.fetch_stage(stage_id).await?;
    Ok(Json(definition))
}

/// POST /api/runner/steps/{id}
/// Report step status, optionally with a chunk of log lines
pub async fn report_step(
    State(app): State<Arc<App>>,
    Path(step_id): Path<Uuid>,
    Json(report): Json<StepReport>,
) -> ApiResult<Json<StepAck>> {
    validate_runner_id(&report.runner_id)?;
    tracing::debug!(
        "Step {} reported {} by {} ({} log lines)",
        step_id,
        report.status,
        report.runner_id,
        report.log.len()
    );

    let ack = app.executions.report_step(step_id, report).await?;
    Ok(Json(ack))
}

// =============================================================================
// Runner Query Endpoints
// =============================================================================

/// GET /api/runners
/// List all known runners with their liveness
pub async fn list_runners(State(app): State<Arc<App>>) -> ApiResult<Json<Vec<RunnerInfo>>> {
    tracing::debug!("Listing all runners");

    let runners = app.runners.list_runners().await?;
    Ok(Json(runners))
}

// =============================================================================
// Validation
// =============================================================================

fn validate_runner_id(runner_id: &str) -> ApiResult<()> {
    if runner_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Runner id cannot be empty".to_string()));
    }
    if runner_id.len() > 255 {
        return Err(ApiError::BadRequest(
            "Runner id is too long (max 255 characters)".to_string(),
        ));
    }
    Ok(())
}
