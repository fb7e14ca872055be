//! Webhook Repository
//!
//! Webhook registrations and their append-only delivery history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::event::EventPosition;
use gantry_core::domain::webhook::{
    DeliveryResult, Webhook, WebhookDelivery, WebhookScope, WebhookTrigger,
};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepoError, RepoResult, WebhookRepository};

pub struct PgWebhookRepository {
    pool: PgPool,
}

impl PgWebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepository for PgWebhookRepository {
    async fn create(&self, webhook: &Webhook) -> RepoResult<()> {
        let (scope_type, scope_id) = scope_to_columns(&webhook.scope);
        let triggers: Vec<&str> = webhook.triggers.iter().map(|t| t.as_str()).collect();

        sqlx::query(
            r#"
            INSERT INTO webhooks (
                id, scope_type, scope_id, display_name, url, secret, triggers,
                enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(webhook.id)
        .bind(scope_type)
        .bind(scope_id)
        .bind(&webhook.display_name)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&triggers)
        .bind(webhook.enabled)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, webhook: &Webhook) -> RepoResult<bool> {
        let triggers: Vec<&str> = webhook.triggers.iter().map(|t| t.as_str()).collect();

        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET display_name = $1, url = $2, secret = $3, triggers = $4,
                enabled = $5, updated_at = $6
            WHERE id = $7
            "#,
        )
        .bind(&webhook.display_name)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&triggers)
        .bind(webhook.enabled)
        .bind(webhook.updated_at)
        .bind(webhook.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, scope_type, scope_id, display_name, url, secret, triggers,
                   enabled, created_at, updated_at
            FROM webhooks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Webhook::try_from).transpose()
    }

    async fn delete(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_scope(&self, scope: &WebhookScope) -> RepoResult<Vec<Webhook>> {
        let (scope_type, scope_id) = scope_to_columns(scope);

        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, scope_type, scope_id, display_name, url, secret, triggers,
                   enabled, created_at, updated_at
            FROM webhooks
            WHERE scope_type = $1 AND scope_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope_type)
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn list_targets(
        &self,
        repo_id: &str,
        pipeline_id: Option<Uuid>,
    ) -> RepoResult<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, scope_type, scope_id, display_name, url, secret, triggers,
                   enabled, created_at, updated_at
            FROM webhooks
            WHERE (scope_type = 'repository' AND scope_id = $1)
               OR (scope_type = 'pipeline' AND scope_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(repo_id)
        .bind(pipeline_id.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn append_delivery(&self, delivery: &WebhookDelivery) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, webhook_id, chain_id, attempt, trigger, event_stream, event_offset,
                retrigger_of, request_body, result, response_status, response_body,
                error, duration_ms, next_retry_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.webhook_id)
        .bind(delivery.chain_id)
        .bind(delivery.attempt as i32)
        .bind(delivery.trigger.as_str())
        .bind(delivery.event.as_ref().map(|e| e.stream.clone()))
        .bind(delivery.event.as_ref().map(|e| e.offset))
        .bind(delivery.retrigger_of)
        .bind(&delivery.request_body)
        .bind(delivery.result.as_str())
        .bind(delivery.response_status.map(i32::from))
        .bind(&delivery.response_body)
        .bind(&delivery.error)
        .bind(delivery.duration_ms as i64)
        .bind(delivery.next_retry_at)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_delivery(&self, id: Uuid) -> RepoResult<Option<WebhookDelivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT id, webhook_id, chain_id, attempt, trigger, event_stream, event_offset,
                   retrigger_of, request_body, result, response_status, response_body,
                   error, duration_ms, next_retry_at, created_at
            FROM webhook_deliveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookDelivery::try_from).transpose()
    }

    async fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: u32,
    ) -> RepoResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT id, webhook_id, chain_id, attempt, trigger, event_stream, event_offset,
                   retrigger_of, request_body, result, response_status, response_body,
                   error, duration_ms, next_retry_at, created_at
            FROM webhook_deliveries
            WHERE webhook_id = $1
            ORDER BY created_at DESC, attempt DESC
            LIMIT $2
            "#,
        )
        .bind(webhook_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }

    async fn list_deliveries_for_event(
        &self,
        webhook_id: Uuid,
        event: &EventPosition,
    ) -> RepoResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT id, webhook_id, chain_id, attempt, trigger, event_stream, event_offset,
                   retrigger_of, request_body, result, response_status, response_body,
                   error, duration_ms, next_retry_at, created_at
            FROM webhook_deliveries
            WHERE webhook_id = $1 AND event_stream = $2 AND event_offset = $3
            ORDER BY created_at ASC, attempt ASC
            "#,
        )
        .bind(webhook_id)
        .bind(&event.stream)
        .bind(event.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }

    async fn list_open_deliveries(&self, limit: u32) -> RepoResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT d.id, d.webhook_id, d.chain_id, d.attempt, d.trigger, d.event_stream,
                   d.event_offset, d.retrigger_of, d.request_body, d.result, d.response_status,
                   d.response_body, d.error, d.duration_ms, d.next_retry_at, d.created_at
            FROM webhook_deliveries d
            JOIN (
                SELECT chain_id, MAX(attempt) AS last_attempt, MIN(created_at) AS opened_at
                FROM webhook_deliveries
                GROUP BY chain_id
            ) c ON c.chain_id = d.chain_id AND c.last_attempt = d.attempt
            WHERE d.next_retry_at IS NOT NULL
            ORDER BY c.opened_at ASC, d.chain_id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }

    async fn has_open_deliveries(&self, webhook_id: Uuid) -> RepoResult<bool> {
        let open = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM webhook_deliveries d
                WHERE d.webhook_id = $1 AND d.next_retry_at IS NOT NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM webhook_deliveries n
                      WHERE n.chain_id = d.chain_id AND n.attempt > d.attempt
                  )
            )
            "#,
        )
        .bind(webhook_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(open)
    }

    async fn delete_deliveries_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_deliveries WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn scope_to_columns(scope: &WebhookScope) -> (&'static str, String) {
    match scope {
        WebhookScope::Repository(repo_id) => ("repository", repo_id.clone()),
        WebhookScope::Pipeline(id) => ("pipeline", id.to_string()),
    }
}

fn parse_trigger(s: &str) -> RepoResult<WebhookTrigger> {
    WebhookTrigger::parse(s)
        .ok_or_else(|| RepoError::Corrupt(format!("unknown webhook trigger {}", s)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    scope_type: String,
    scope_id: String,
    display_name: String,
    url: String,
    secret: String,
    triggers: Vec<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = RepoError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        let scope = match row.scope_type.as_str() {
            "repository" => WebhookScope::Repository(row.scope_id),
            "pipeline" => WebhookScope::Pipeline(
                Uuid::parse_str(&row.scope_id).map_err(|e| RepoError::Corrupt(e.to_string()))?,
            ),
            other => return Err(RepoError::Corrupt(format!("unknown webhook scope {}", other))),
        };
        let triggers = row
            .triggers
            .iter()
            .map(|t| parse_trigger(t))
            .collect::<RepoResult<Vec<_>>>()?;

        Ok(Webhook {
            id: row.id,
            scope,
            display_name: row.display_name,
            url: row.url,
            secret: row.secret,
            triggers,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    webhook_id: Uuid,
    chain_id: Uuid,
    attempt: i32,
    trigger: String,
    event_stream: Option<String>,
    event_offset: Option<i64>,
    retrigger_of: Option<Uuid>,
    request_body: String,
    result: String,
    response_status: Option<i32>,
    response_body: Option<String>,
    error: Option<String>,
    duration_ms: i64,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = RepoError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let result = DeliveryResult::parse(&row.result)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown delivery result {}", row.result)))?;
        let event = match (row.event_stream, row.event_offset) {
            (Some(stream), Some(offset)) => Some(EventPosition { stream, offset }),
            _ => None,
        };

        Ok(WebhookDelivery {
            id: row.id,
            webhook_id: row.webhook_id,
            chain_id: row.chain_id,
            attempt: row.attempt.max(0) as u32,
            trigger: parse_trigger(&row.trigger)?,
            event,
            retrigger_of: row.retrigger_of,
            request_body: row.request_body,
            result,
            response_status: row.response_status.and_then(|s| u16::try_from(s).ok()),
            response_body: row.response_body,
            error: row.error,
            duration_ms: row.duration_ms.max(0) as u64,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
        })
    }
}
