//! Trigger command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::trigger::{Trigger, TriggerAction};
use gantry_core::dto::trigger::CreateTrigger;

use crate::config::Config;
use crate::id_resolver::{resolve_pipeline_id, resolve_trigger_id};
use crate::types::parse_name;

/// Trigger subcommands
#[derive(Subcommand)]
pub enum TriggerCommands {
    /// Attach a trigger rule to a pipeline
    ///
    /// Omitted actions, refs or paths match every event.
    Create {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,

        /// Identifier unique within the pipeline
        #[arg(short, long)]
        uid: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Actions to react to (e.g. branch_updated,pullreq_created)
        #[arg(short, long, value_delimiter = ',', value_parser = parse_name::<TriggerAction>)]
        action: Vec<TriggerAction>,

        /// Ref globs (e.g. refs/heads/release/*)
        #[arg(short, long = "ref")]
        refs: Vec<String>,

        /// Changed path globs (e.g. src/**)
        #[arg(short, long)]
        path: Vec<String>,

        /// Create the trigger disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List the triggers of a pipeline
    List {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,
    },
    /// Enable a trigger
    Enable {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,
        /// Trigger ID or unambiguous prefix
        trigger: String,
    },
    /// Disable a trigger
    Disable {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,
        /// Trigger ID or unambiguous prefix
        trigger: String,
    },
}

/// Handle trigger commands
pub async fn handle_trigger_command(command: TriggerCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        TriggerCommands::Create {
            pipeline,
            uid,
            description,
            action,
            refs,
            path,
            disabled,
        } => {
            let req = CreateTrigger {
                uid,
                description,
                actions: action,
                ref_patterns: refs,
                path_patterns: path,
                enabled: !disabled,
            };
            create_trigger(&client, &pipeline, req).await
        }
        TriggerCommands::List { pipeline } => list_triggers(&client, &pipeline).await,
        TriggerCommands::Enable { pipeline, trigger } => {
            set_enabled(&client, &pipeline, &trigger, true).await
        }
        TriggerCommands::Disable { pipeline, trigger } => {
            set_enabled(&client, &pipeline, &trigger, false).await
        }
    }
}

async fn create_trigger(client: &OrchestratorClient, pipeline: &str, req: CreateTrigger) -> Result<()> {
    let pipeline_id = resolve_pipeline_id(client, pipeline).await?;
    let trigger = client.create_trigger(pipeline_id, req).await?;

    println!("{}", "✓ Trigger created successfully!".green().bold());
    print_trigger(&trigger);

    Ok(())
}

async fn list_triggers(client: &OrchestratorClient, pipeline: &str) -> Result<()> {
    let pipeline_id = resolve_pipeline_id(client, pipeline).await?;
    let triggers = client.list_triggers(pipeline_id).await?;

    if triggers.is_empty() {
        println!("{}", "No triggers found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} trigger(s):", triggers.len()).bold());
    println!();
    for trigger in triggers {
        print_trigger(&trigger);
        println!();
    }

    Ok(())
}

async fn set_enabled(
    client: &OrchestratorClient,
    pipeline: &str,
    trigger: &str,
    enabled: bool,
) -> Result<()> {
    let pipeline_id = resolve_pipeline_id(client, pipeline).await?;
    let trigger_id = resolve_trigger_id(client, pipeline_id, trigger).await?;

    let trigger = client.set_trigger_enabled(trigger_id, enabled).await?;

    let verb = if trigger.enabled { "enabled" } else { "disabled" };
    println!(
        "{}",
        format!("✓ Trigger {} {}", trigger.uid, verb).green().bold()
    );

    Ok(())
}

fn print_trigger(trigger: &Trigger) {
    let state = if trigger.enabled {
        "enabled".green()
    } else {
        "disabled".dimmed()
    };
    println!("  {} {} ({})", "▸".cyan(), trigger.uid.bold(), state);
    println!("    ID:      {}", trigger.id.to_string().dimmed());
    if let Some(desc) = &trigger.description {
        println!("    Description: {}", desc.dimmed());
    }
    println!("    Actions: {}", describe(trigger.actions.iter().map(|a| a.as_str())));
    println!("    Refs:    {}", describe(trigger.ref_patterns.iter().map(String::as_str)));
    println!("    Paths:   {}", describe(trigger.path_patterns.iter().map(String::as_str)));
}

/// An empty filter matches everything
fn describe<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let values: Vec<&str> = values.collect();
    if values.is_empty() {
        "any".to_string()
    } else {
        values.join(", ")
    }
}
