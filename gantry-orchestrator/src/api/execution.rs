//! Execution API Handlers
//!
//! Manual runs, execution queries, cancellation, and the live streams an
//! operator UI follows (status changes and step logs over SSE).

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use gantry_core::domain::execution::Execution;
use gantry_core::domain::log::LogLine;
use gantry_core::dto::execution::{CancelExecution, ExecutionDetail, RunPipeline};

use crate::api::error::{ApiError, ApiResult};
use crate::app::App;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub limit: Option<u32>,
}

// =============================================================================
// Execution Lifecycle Endpoints
// =============================================================================

/// POST /api/pipelines/{id}/executions
/// Run a pipeline manually on a branch (the default branch when omitted)
pub async fn run_pipeline(
    State(app): State<Arc<App>>,
    Path(pipeline_id): Path<Uuid>,
    body: Option<Json<RunPipeline>>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    tracing::info!(
        "Manual run of pipeline {} (branch: {:?})",
        pipeline_id,
        req.branch
    );

    let execution = app.executions.run_manual(pipeline_id, req).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

/// POST /api/executions/{id}/cancel
/// Request cancellation; running stages get a grace period to stop
pub async fn cancel_execution(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelExecution>>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    tracing::info!("Cancel requested for execution {} by {:?}", id, req.requested_by);

    let execution = app.canceler.request(id, req).await?;
    let status = if execution.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(execution)))
}

// =============================================================================
// Execution Query Endpoints
// =============================================================================

/// GET /api/pipelines/{id}/executions
/// List executions of a pipeline, newest first
pub async fn list_executions(
    State(app): State<Arc<App>>,
    Path(pipeline_id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<Vec<Execution>>> {
    let limit = validate_limit(query.limit)?;
    tracing::debug!("Listing executions of pipeline {} (limit {})", pipeline_id, limit);

    let executions = app.executions.list(pipeline_id, limit).await?;
    Ok(Json(executions))
}

/// GET /api/executions/{id}
/// Execution with its stages and steps
pub async fn get_execution(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionDetail>> {
    tracing::debug!("Getting execution: {}", id);

    let detail = app.executions.get_detail(id).await?;
    Ok(Json(detail))
}

/// GET /api/steps/{id}/logs
/// Stored log lines of a step
pub async fn get_step_logs(
    State(app): State<Arc<App>>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogLine>>> {
    tracing::debug!("Getting logs for step: {}", step_id);

    let logs = app.executions.logs(step_id).await?;
    Ok(Json(logs))
}

// =============================================================================
// Live streams
// =============================================================================

/// GET /api/executions/{id}/events
/// SSE stream: a `snapshot` event with the current tree, then one event per
/// execution, stage or step change
pub async fn stream_execution(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    // Subscribe before the snapshot so no change falls in between
    let updates = app.streamer.subscribe(id);
    let detail = app.executions.get_detail(id).await?;
    tracing::debug!("Streaming execution {}", id);

    let snapshot = stream::once(async move { Event::default().event("snapshot").json_data(&detail) });
    let live = updates.map(|update| Event::default().event(update.kind()).json_data(&update));

    Ok(sse(snapshot.chain(live)))
}

/// GET /api/steps/{id}/logs/stream
/// SSE stream of a step's log lines: the stored backlog, then live lines
/// until the step finishes
pub async fn stream_step_logs(
    State(app): State<Arc<App>>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let live = app.logs.subscribe(step_id);
    let backlog = app.executions.logs(step_id).await?;
    let finished = app.executions.step_status(step_id).await?.is_terminal();
    tracing::debug!("Streaming logs of step {} ({} stored lines)", step_id, backlog.len());

    // Lines stored between subscribe and read arrive twice; drop the older copies
    let last = backlog.last().cloned();
    let live = live.filter(move |line| {
        let fresh = match &last {
            Some(last) => line.timestamp > last.timestamp
                || (line.timestamp == last.timestamp && line != last),
            None => true,
        };
        async move { fresh }
    });

    let backlog = stream::iter(backlog);
    let lines = if finished {
        backlog.boxed()
    } else {
        backlog.chain(live).boxed()
    };
    let events = lines.map(|line| Event::default().event("log").json_data(&line));

    Ok(sse(events))
}

fn sse<S>(events: S) -> impl IntoResponse
where
    S: Stream<Item = Result<Event, axum::Error>> + Send + 'static,
{
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

// =============================================================================
// Validation
// =============================================================================

fn validate_limit(limit: Option<u32>) -> ApiResult<u32> {
    match limit {
        None => Ok(DEFAULT_LIST_LIMIT),
        Some(0) => Err(ApiError::BadRequest("limit must be greater than 0".to_string())),
        Some(n) if n > MAX_LIST_LIMIT => Err(ApiError::BadRequest(format!(
            "limit cannot exceed {}",
            MAX_LIST_LIMIT
        ))),
        Some(n) => Ok(n),
    }
}
