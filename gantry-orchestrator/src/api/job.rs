//! Job API Handlers
//!
//! Read-only view of the background job queue, mostly for spotting dead
//! jobs.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use std::sync::Arc;

use gantry_core::domain::job::{Job, JobState};

use crate::api::error::{ApiError, ApiResult};
use crate::app::App;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// `scheduled`, `running`, `succeeded` or `dead`; defaults to `scheduled`
    pub state: Option<String>,
    pub limit: Option<u32>,
}

/// GET /api/jobs
/// List jobs in one state
///
/// Query parameters:
/// - `state` (optional): job state, `scheduled` when omitted
/// - `limit` (optional): at most this many jobs, 100 by default
pub async fn list_jobs(
    State(app): State<Arc<App>>,
    Query(params): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let state = match params.state.as_deref() {
        None => JobState::Scheduled,
        Some(raw) => JobState::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown job state: {}", raw)))?,
    };
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    tracing::debug!("Listing {} jobs", state.as_str());

    let jobs = app.scheduler.list(state, limit).await?;
    Ok(Json(jobs))
}

/// GET /api/jobs/{id}
/// Get job details by ID
pub async fn get_job(State(app): State<Arc<App>>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = app.scheduler.get(&id).await?;
    Ok(Json(job))
}
