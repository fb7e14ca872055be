//! Webhooks
//!
//! Operator surface for webhook registration and delivery history. The
//! delivery itself lives in [`dispatcher`].

pub mod dispatcher;
pub mod signature;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::info;
use url::{Host, Url};
use uuid::Uuid;

use gantry_core::domain::webhook::{Webhook, WebhookDelivery, WebhookScope};
use gantry_core::dto::webhook::{CreateWebhook, UpdateWebhook};

use crate::clock::SharedClock;
use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use crate::repository::{PipelineRepository, WebhookRepository};

use dispatcher::WebhookDispatcher;

pub struct WebhookService {
    webhooks: Arc<dyn WebhookRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    dispatcher: Arc<WebhookDispatcher>,
    clock: SharedClock,
    config: WebhookConfig,
}

impl WebhookService {
    pub fn new(
        webhooks: Arc<dyn WebhookRepository>,
        pipelines: Arc<dyn PipelineRepository>,
        dispatcher: Arc<WebhookDispatcher>,
        clock: SharedClock,
        config: WebhookConfig,
    ) -> Self {
        Self {
            webhooks,
            pipelines,
            dispatcher,
            clock,
            config,
        }
    }

    pub async fn create(&self, req: CreateWebhook) -> Result<Webhook> {
        if req.display_name.trim().is_empty() {
            return Err(Error::Validation("display_name cannot be empty".to_string()));
        }
        self.validate_url(&req.url)?;
        self.validate_scope(&req.scope).await?;

        let now = self.clock.now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            scope: req.scope,
            display_name: req.display_name,
            url: req.url,
            secret: req.secret,
            triggers: req.triggers,
            enabled: req.enabled,
            created_at: now,
            updated_at: now,
        };
        self.webhooks.create(&webhook).await?;
        info!(webhook_id = %webhook.id, url = %webhook.url, "Webhook created");
        Ok(webhook)
    }

    pub async fn update(&self, id: Uuid, req: UpdateWebhook) -> Result<Webhook> {
        let mut webhook = self.get(id).await?;
        if let Some(name) = req.display_name {
            if name.trim().is_empty() {
                return Err(Error::Validation("display_name cannot be empty".to_string()));
            }
            webhook.display_name = name;
        }
        if let Some(url) = req.url {
            self.validate_url(&url)?;
            webhook.url = url;
        }
        if let Some(secret) = req.secret {
            webhook.secret = secret;
        }
        if let Some(triggers) = req.triggers {
            webhook.triggers = triggers;
        }
        if let Some(enabled) = req.enabled {
            webhook.enabled = enabled;
        }
        webhook.updated_at = self.clock.now();

        if !self.webhooks.update(&webhook).await? {
            return Err(Error::NotFound(format!("webhook {}", id)));
        }
        info!(webhook_id = %id, "Webhook updated");
        Ok(webhook)
    }

    pub async fn get(&self, id: Uuid) -> Result<Webhook> {
        self.webhooks
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("webhook {}", id)))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.webhooks.delete(id).await? {
            return Err(Error::NotFound(format!("webhook {}", id)));
        }
        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    pub async fn list(&self, scope: &WebhookScope) -> Result<Vec<Webhook>> {
        Ok(self.webhooks.list_by_scope(scope).await?)
    }

    /// Delivery attempts, newest first
    pub async fn deliveries(&self, webhook_id: Uuid, limit: u32) -> Result<Vec<WebhookDelivery>> {
        self.get(webhook_id).await?;
        Ok(self.webhooks.list_deliveries(webhook_id, limit).await?)
    }

    /// Re-sends the stored request body of a delivery as a new chain
    pub async fn retrigger(&self, delivery_id: Uuid) -> Result<WebhookDelivery> {
        let original = self
            .webhooks
            .find_delivery(delivery_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("delivery {}", delivery_id)))?;
        let webhook = self.get(original.webhook_id).await?;
        self.dispatcher.retrigger(&webhook, &original).await
    }

    async fn validate_scope(&self, scope: &WebhookScope) -> Result<()> {
        match scope {
            WebhookScope::Repository(repo_id) if repo_id.trim().is_empty() => Err(
                Error::Validation("repository id cannot be empty".to_string()),
            ),
            WebhookScope::Repository(_) => Ok(()),
            WebhookScope::Pipeline(id) => match self.pipelines.find_by_id(*id).await? {
                Some(_) => Ok(()),
                None => Err(Error::NotFound(format!("pipeline {}", id))),
            },
        }
    }

    fn validate_url(&self, raw: &str) -> Result<()> {
        validate_url(raw, &self.config)
    }
}

/// Accepts http(s) URLs, rejecting loopback and private-network hosts unless
/// the configuration allows them. Names are not resolved.
pub fn validate_url(raw: &str, config: &WebhookConfig) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::Validation(format!("invalid url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "url scheme must be http or https, got {}",
            url.scheme()
        )));
    }

    let (loopback, private) = match url.host() {
        None => return Err(Error::Validation("url has no host".to_string())),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            (domain == "localhost" || domain.ends_with(".localhost"), false)
        }
        Some(Host::Ipv4(ip)) => (ip.is_loopback(), is_private_v4(ip)),
        Some(Host::Ipv6(ip)) => (ip.is_loopback(), is_private_v6(ip)),
    };

    if loopback && !config.allow_loopback {
        return Err(Error::Validation("loopback urls are not allowed".to_string()));
    }
    if private && !config.allow_private_network {
        return Err(Error::Validation(
            "private network urls are not allowed".to_string(),
        ));
    }
    Ok(())
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4) || v4.is_loopback();
    }
    let first = ip.segments()[0];
    ip.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
