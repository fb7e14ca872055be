//! Webhook command handlers
//!
//! Manages webhooks on repositories and pipelines and inspects their
//! delivery history.

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::webhook::{
    DeliveryResult, Webhook, WebhookDelivery, WebhookScope, WebhookTrigger,
};
use gantry_core::dto::webhook::{CreateWebhook, UpdateWebhook};
use uuid::Uuid;

use super::format_time;
use crate::config::Config;
use crate::id_resolver::resolve_pipeline_id;
use crate::types::parse_name;

/// Owner of a webhook: exactly one of a repository or a pipeline
#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct ScopeArgs {
    /// Repository ID (e.g. acme/api)
    #[arg(long)]
    repo: Option<String>,

    /// Pipeline ID or unambiguous prefix
    #[arg(long)]
    pipeline: Option<String>,
}

impl ScopeArgs {
    async fn resolve(self, client: &OrchestratorClient) -> Result<WebhookScope> {
        match (self.repo, self.pipeline) {
            (Some(repo), _) => Ok(WebhookScope::Repository(repo)),
            (None, Some(pipeline)) => Ok(WebhookScope::Pipeline(
                resolve_pipeline_id(client, &pipeline).await?,
            )),
            (None, None) => anyhow::bail!("either --repo or --pipeline is required"),
        }
    }
}

/// Webhook subcommands
#[derive(Subcommand)]
pub enum WebhookCommands {
    /// Register a webhook
    ///
    /// Without --trigger the webhook receives every event of its scope.
    Create {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(short, long)]
        name: String,

        /// Endpoint receiving the POST requests
        #[arg(short, long)]
        url: String,

        /// Key for the X-Gantry-Signature HMAC
        #[arg(short, long, env = "GANTRY_WEBHOOK_SECRET", default_value = "")]
        secret: String,

        /// Events to deliver (e.g. branch_updated,execution_completed)
        #[arg(short, long, value_delimiter = ',', value_parser = parse_name::<WebhookTrigger>)]
        trigger: Vec<WebhookTrigger>,

        /// Create the webhook disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List the webhooks of a repository or pipeline
    List {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Get webhook details
    Get { id: Uuid },
    /// Change a webhook; omitted fields stay as they are
    Update {
        id: Uuid,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        url: Option<String>,

        #[arg(short, long)]
        secret: Option<String>,

        /// Replaces the subscribed events
        #[arg(short, long, value_delimiter = ',', value_parser = parse_name::<WebhookTrigger>)]
        trigger: Option<Vec<WebhookTrigger>>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },
    /// Delete a webhook
    Delete { id: Uuid },
    /// Show recent delivery attempts of a webhook
    Deliveries {
        id: Uuid,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Send a past delivery again
    Retrigger {
        /// Delivery ID
        delivery: Uuid,
    },
}

/// Handle webhook commands
pub async fn handle_webhook_command(command: WebhookCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        WebhookCommands::Create {
            scope,
            name,
            url,
            secret,
            trigger,
            disabled,
        } => {
            let req = CreateWebhook {
                scope: scope.resolve(&client).await?,
                display_name: name,
                url,
                secret,
                triggers: trigger,
                enabled: !disabled,
            };
            let webhook = client.create_webhook(req).await?;

            println!("{}", "✓ Webhook created successfully!".green().bold());
            print_webhook(&webhook);
            Ok(())
        }
        WebhookCommands::List { scope } => {
            let scope = scope.resolve(&client).await?;
            list_webhooks(&client, &scope).await
        }
        WebhookCommands::Get { id } => {
            let webhook = client.get_webhook(id).await?;
            print_webhook(&webhook);
            Ok(())
        }
        WebhookCommands::Update {
            id,
            name,
            url,
            secret,
            trigger,
            enable,
            disable,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let req = UpdateWebhook {
                display_name: name,
                url,
                secret,
                triggers: trigger,
                enabled,
            };
            let webhook = client.update_webhook(id, req).await?;

            println!("{}", "✓ Webhook updated successfully!".green().bold());
            print_webhook(&webhook);
            Ok(())
        }
        WebhookCommands::Delete { id } => {
            client.delete_webhook(id).await?;
            println!(
                "{}",
                format!("✓ Webhook {} deleted successfully!", id)
                    .green()
                    .bold()
            );
            Ok(())
        }
        WebhookCommands::Deliveries { id, limit } => list_deliveries(&client, id, limit).await,
        WebhookCommands::Retrigger { delivery } => {
            let delivery = client.retrigger_delivery(delivery).await?;
            println!("{}", "✓ Delivery sent again".green().bold());
            print_delivery(&delivery);
            Ok(())
        }
    }
}

async fn list_webhooks(client: &OrchestratorClient, scope: &WebhookScope) -> Result<()> {
    let webhooks = client.list_webhooks(scope).await?;

    if webhooks.is_empty() {
        println!("{}", "No webhooks found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} webhook(s):", webhooks.len()).bold());
    println!();
    for webhook in webhooks {
        print_webhook(&webhook);
        println!();
    }

    Ok(())
}

async fn list_deliveries(client: &OrchestratorClient, id: Uuid, limit: u32) -> Result<()> {
    let deliveries = client.list_deliveries(id, limit).await?;

    if deliveries.is_empty() {
        println!("{}", "No deliveries yet.".yellow());
        return Ok(());
    }

    for delivery in deliveries {
        print_delivery(&delivery);
    }

    Ok(())
}

fn print_webhook(webhook: &Webhook) {
    let state = if webhook.enabled {
        "enabled".green()
    } else {
        "disabled".dimmed()
    };
    println!("  {} {} ({})", "▸".cyan(), webhook.display_name.bold(), state);
    println!("    ID:       {}", webhook.id.to_string().cyan());
    match &webhook.scope {
        WebhookScope::Repository(repo) => println!("    Repo:     {}", repo),
        WebhookScope::Pipeline(pipeline) => println!("    Pipeline: {}", pipeline),
    }
    println!("    URL:      {}", webhook.url);
    let triggers = if webhook.triggers.is_empty() {
        "all events".to_string()
    } else {
        webhook
            .triggers
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("    Events:   {}", triggers.dimmed());
}

fn print_delivery(delivery: &WebhookDelivery) {
    let result = match delivery.result {
        DeliveryResult::Success => delivery.result.as_str().green(),
        DeliveryResult::RetriableError => delivery.result.as_str().yellow(),
        DeliveryResult::FatalError => delivery.result.as_str().red(),
        DeliveryResult::Queued => delivery.result.as_str().dimmed(),
    };
    let status = delivery
        .response_status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!(
        "  {} {} {} attempt {} {} {}ms",
        "▸".cyan(),
        format_time(&delivery.created_at).dimmed(),
        delivery.trigger.as_str().bold(),
        delivery.attempt,
        result,
        delivery.duration_ms
    );
    println!("    ID:     {}  HTTP {}", delivery.id.to_string().dimmed(), status);
    if let Some(error) = &delivery.error {
        println!("    Error:  {}", error.red());
    }
    if let Some(next) = &delivery.next_retry_at {
        println!("    Retry:  {}", format_time(next));
    }
    if let Some(original) = &delivery.retrigger_of {
        println!("    Resent from {}", original.to_string().dimmed());
    }
}
