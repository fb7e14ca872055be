//! Webhook API Handlers
//!
//! HTTP endpoints for webhook registration and delivery history.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use gantry_core::domain::webhook::{Webhook, WebhookDelivery, WebhookScope};
use gantry_core::dto::webhook::{CreateWebhook, UpdateWebhook};

use crate::api::error::{ApiError, ApiResult};
use crate::app::App;

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub repo_id: Option<String>,
    pub pipeline_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub limit: Option<u32>,
}

/// POST /api/webhooks
/// Register a webhook on a repository or a single pipeline
pub async fn create_webhook(
    State(app): State<Arc<App>>,
    Json(req): Json<CreateWebhook>,
) -> ApiResult<(StatusCode, Json<Webhook>)> {
    tracing::info!("Creating webhook: {} -> {}", req.display_name, req.url);

    let webhook = app.webhooks.create(req).await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

/// GET /api/webhooks?repo_id= or ?pipeline_id=
/// List the webhooks of one scope
pub async fn list_webhooks(
    State(app): State<Arc<App>>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<Vec<Webhook>>> {
    let scope = match (query.repo_id, query.pipeline_id) {
        (Some(repo_id), None) => WebhookScope::Repository(repo_id),
        (None, Some(pipeline_id)) => WebhookScope::Pipeline(pipeline_id),
        _ => {
            return Err(ApiError::BadRequest(
                "Exactly one of repo_id or pipeline_id is required".to_string(),
            ));
        }
    };
    tracing::debug!("Listing webhooks of {:?}", scope);

    let webhooks = app.webhooks.list(&scope).await?;
    Ok(Json(webhooks))
}

/// GET /api/webhooks/{id}
pub async fn get_webhook(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Webhook>> {
    Ok(Json(app.webhooks.get(id).await?))
}

/// PUT /api/webhooks/{id}
/// Update a webhook; absent fields are kept
pub async fn update_webhook(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWebhook>,
) -> ApiResult<Json<Webhook>> {
    tracing::info!("Updating webhook: {}", id);

    let webhook = app.webhooks.update(id, req).await?;
    Ok(Json(webhook))
}

/// DELETE /api/webhooks/{id}
pub async fn delete_webhook(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting webhook: {}", id);

    app.webhooks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/webhooks/{id}/deliveries
/// Delivery attempts, newest first
pub async fn list_deliveries(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListDeliveriesQuery>,
) -> ApiResult<Json<Vec<WebhookDelivery>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    tracing::debug!("Listing deliveries of webhook {} (limit {})", id, limit);

    let deliveries = app.webhooks.deliveries(id, limit).await?;
    Ok(Json(deliveries))
}

/// POST /api/deliveries/{id}/retrigger
/// Re-send a recorded delivery as a new delivery chain
pub async fn retrigger_delivery(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookDelivery>> {
    tracing::info!("Re-triggering delivery: {}", id);

    let delivery = app.webhooks.retrigger(id).await?;
    Ok(Json(delivery))
}
