//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod event;
mod execution;
mod job;
mod pipeline;
mod runner;
mod trigger;
mod webhook;

pub use event::EventCommands;
pub use execution::ExecutionCommands;
pub use job::JobCommands;
pub use pipeline::PipelineCommands;
pub use runner::RunnerCommands;
pub use trigger::TriggerCommands;
pub use webhook::WebhookCommands;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::*;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Trigger rules of a pipeline
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Execution inspection, cancellation and logs
    Execution {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
    /// Webhooks and their delivery history
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    /// Background jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Runner management
    Runner {
        #[command(subcommand)]
        command: RunnerCommands,
    },
    /// Publish repository events by hand
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Trigger { command } => trigger::handle_trigger_command(command, config).await,
        Commands::Execution { command } => {
            execution::handle_execution_command(command, config).await
        }
        Commands::Webhook { command } => webhook::handle_webhook_command(command, config).await,
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Runner { command } => runner::handle_runner_command(command, config).await,
        Commands::Event { command } => event::handle_event_command(command, config).await,
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Color a snake_case status name by outcome
fn colorize_status(status: &str) -> ColoredString {
    match status {
        "success" | "succeeded" => status.green(),
        "failure" | "error" | "dead" => status.red(),
        "running" => status.cyan(),
        "canceled" | "skipped" => status.dimmed(),
        _ => status.yellow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T08:05:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(&at), "2026-03-01 08:05:09");
    }
}
