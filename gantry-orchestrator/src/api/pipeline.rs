//! Pipeline API Handlers
//!
//! HTTP endpoints for pipelines, their trigger rules and cron schedules.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use gantry_core::domain::check::Check;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::trigger::Trigger;
use gantry_core::dto::pipeline::{CreatePipeline, SchedulePipeline, ScheduleResponse};
use gantry_core::dto::trigger::CreateTrigger;

use crate::api::error::ApiResult;
use crate::app::App;
use crate::scheduler::Enqueued;
use crate::scheduler::maintenance::{CronRun, schedule_pipeline};

#[derive(Debug, Deserialize)]
pub struct ListPipelinesQuery {
    pub repo_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChecksQuery {
    pub repo_id: String,
    pub commit_sha: String,
}

// =============================================================================
// Pipelines
// =============================================================================

/// POST /api/pipelines
/// Register a pipeline
pub async fn create_pipeline(
    State(app): State<Arc<App>>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    tracing::info!("Creating pipeline: {} in {}", req.uid, req.repo_id);

    let pipeline = app.pipelines.create_pipeline(req).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /api/pipelines
/// List pipelines, optionally of one repository
pub async fn list_pipelines(
    State(app): State<Arc<App>>,
    Query(query): Query<ListPipelinesQuery>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    tracing::debug!("Listing pipelines (repo: {:?})", query.repo_id);

    let pipelines = app.pipelines.list_pipelines(query.repo_id.as_deref()).await?;
    Ok(Json(pipelines))
}

/// GET /api/pipelines/{id}
/// Get pipeline by ID
pub async fn get_pipeline(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    tracing::debug!("Getting pipeline: {}", id);

    let pipeline = app.pipelines.get_pipeline(id).await?;
    Ok(Json(pipeline))
}

/// DELETE /api/pipelines/{id}
/// Delete a pipeline
pub async fn delete_pipeline(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", id);

    app.pipelines.delete_pipeline(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Triggers
// =============================================================================

/// POST /api/pipelines/{id}/triggers
/// Attach a trigger rule to a pipeline
pub async fn create_trigger(
    State(app): State<Arc<App>>,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<CreateTrigger>,
) -> ApiResult<(StatusCode, Json<Trigger>)> {
    tracing::info!("Creating trigger {} on pipeline {}", req.uid, pipeline_id);

    let trigger = app.pipelines.create_trigger(pipeline_id, req).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

/// GET /api/pipelines/{id}/triggers
/// List the trigger rules of a pipeline
pub async fn list_triggers(
    State(app): State<Arc<App>>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Trigger>>> {
    tracing::debug!("Listing triggers of pipeline {}", pipeline_id);

    let triggers = app.pipelines.list_triggers(pipeline_id).await?;
    Ok(Json(triggers))
}

/// POST /api/triggers/{id}/enable
pub async fn enable_trigger(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Trigger>> {
    Ok(Json(app.pipelines.enable_trigger(id).await?))
}

/// POST /api/triggers/{id}/disable
pub async fn disable_trigger(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Trigger>> {
    Ok(Json(app.pipelines.disable_trigger(id).await?))
}

// =============================================================================
// Cron schedules
// =============================================================================

/// POST /api/pipelines/{id}/schedule
/// Run the pipeline on a cron expression; a second request for the same
/// pipeline returns the existing schedule unchanged
pub async fn schedule(
    State(app): State<Arc<App>>,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<SchedulePipeline>,
) -> ApiResult<(StatusCode, Json<ScheduleResponse>)> {
    app.pipelines.get_pipeline(pipeline_id).await?;
    tracing::info!("Scheduling pipeline {} on '{}'", pipeline_id, req.expression);

    let run = CronRun {
        pipeline_id,
        branch: req.branch,
        params: req.params,
    };
    let (id, enqueued) = schedule_pipeline(&app.scheduler, &req.expression, run).await?;
    let job = app.scheduler.get(&id).await?;

    let created = enqueued == Enqueued::Accepted;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ScheduleResponse { job, created })))
}

// =============================================================================
// Commit checks
// =============================================================================

/// GET /api/checks?repo_id=&commit_sha=
/// One check per pipeline that built the commit
pub async fn list_checks(
    State(app): State<Arc<App>>,
    Query(query): Query<ChecksQuery>,
) -> ApiResult<Json<Vec<Check>>> {
    tracing::debug!("Listing checks of {}@{}", query.repo_id, query.commit_sha);

    let checks = app.checks.list(&query.repo_id, &query.commit_sha).await?;
    Ok(Json(checks))
}
