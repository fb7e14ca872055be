//! Webhook DTOs for the operator API

use serde::{Deserialize, Serialize};

use crate::domain::webhook::{WebhookScope, WebhookTrigger};

/// Request to create a webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhook {
    pub scope: WebhookScope,
    pub display_name: String,
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub triggers: Vec<WebhookTrigger>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Partial webhook update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWebhook {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub triggers: Option<Vec<WebhookTrigger>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

fn default_enabled() -> bool {
    true
}
