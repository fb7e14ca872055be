//! Event ingestion
//!
//! Entry point for the repository service: ref and pull request changes are
//! recorded on the bus and picked up asynchronously by the trigger engine
//! and the webhook dispatcher.

use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;

use gantry_core::domain::event::{GitEvent, PullReqEvent, streams};
use gantry_core::dto::event::Published;

use crate::api::error::{ApiError, ApiResult};
use crate::app::App;

/// POST /api/events/git
/// Publish a ref change
pub async fn publish_git_event(
    State(app): State<Arc<App>>,
    Json(event): Json<GitEvent>,
) -> ApiResult<(StatusCode, Json<Published>)> {
    validate_repo_id(&event.repo_id)?;
    if !event.ref_name.starts_with("refs/") {
        return Err(ApiError::BadRequest(format!(
            "ref_name must be a full ref: {}",
            event.ref_name
        )));
    }
    tracing::info!("Git event {:?} on {} {}", event.kind, event.repo_id, event.ref_name);

    // Keyed by repository so one repository's events stay ordered
    let offset = app
        .bus
        .publish_json(streams::GIT, &event.repo_id, &event)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Published {
            stream: streams::GIT.to_string(),
            offset,
        }),
    ))
}

/// POST /api/events/pullreq
/// Publish a pull request change
pub async fn publish_pullreq_event(
    State(app): State<Arc<App>>,
    Json(event): Json<PullReqEvent>,
) -> ApiResult<(StatusCode, Json<Published>)> {
    validate_repo_id(&event.repo_id)?;
    tracing::info!(
        "Pull request event {:?} on {}#{}",
        event.kind,
        event.repo_id,
        event.number
    );

    let offset = app
        .bus
        .publish_json(streams::PULLREQ, &event.repo_id, &event)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Published {
            stream: streams::PULLREQ.to_string(),
            offset,
        }),
    ))
}

fn validate_repo_id(repo_id: &str) -> ApiResult<()> {
    if repo_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Repository id cannot be empty".to_string()));
    }
    Ok(())
}
