//! Webhook endpoints

use uuid::Uuid;

use gantry_core::domain::webhook::{Webhook, WebhookDelivery, WebhookScope};
use gantry_core::dto::webhook::{CreateWebhook, UpdateWebhook};

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    pub async fn create_webhook(&self, req: CreateWebhook) -> Result<Webhook> {
        let response = self
            .client
            .post(self.url("/api/webhooks"))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List the webhooks registered on one repository or pipeline
    pub async fn list_webhooks(&self, scope: &WebhookScope) -> Result<Vec<Webhook>> {
        let query = match scope {
            WebhookScope::Repository(repo_id) => ("repo_id", repo_id.clone()),
            WebhookScope::Pipeline(pipeline_id) => ("pipeline_id", pipeline_id.to_string()),
        };
        let response = self
            .client
            .get(self.url("/api/webhooks"))
            .query(&[query])
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn get_webhook(&self, webhook_id: Uuid) -> Result<Webhook> {
        let response = self
            .client
            .get(self.url(&format!("/api/webhooks/{}", webhook_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn update_webhook(&self, webhook_id: Uuid, req: UpdateWebhook) -> Result<Webhook> {
        let response = self
            .client
            .put(self.url(&format!("/api/webhooks/{}", webhook_id)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn delete_webhook(&self, webhook_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/webhooks/{}", webhook_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Delivery attempts of a webhook, newest first
    pub async fn list_deliveries(&self, webhook_id: Uuid, limit: u32) -> Result<Vec<WebhookDelivery>> {
        let response = self
            .client
            .get(self.url(&format!("/api/webhooks/{}/deliveries", webhook_id)))
            .query(&[("limit", limit)])
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Send a recorded delivery again, starting a new retry chain
    pub async fn retrigger_delivery(&self, delivery_id: Uuid) -> Result<WebhookDelivery> {
        let response = self
            .client
            .post(self.url(&format!("/api/deliveries/{}/retrigger", delivery_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
