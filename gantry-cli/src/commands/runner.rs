//! Runner command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::dto::runner::RunnerInfo;

use super::format_time;
use crate::config::Config;

/// Runner subcommands
#[derive(Subcommand)]
pub enum RunnerCommands {
    /// List all runners that have polled the orchestrator
    List,
}

/// Handle runner commands
pub async fn handle_runner_command(command: RunnerCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunnerCommands::List => list_runners(&client).await,
    }
}

async fn list_runners(client: &OrchestratorClient) -> Result<()> {
    let runners = client.list_runners().await?;

    if runners.is_empty() {
        println!("{}", "No runners registered.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} registered runner(s):", runners.len()).bold()
        );
        println!();
        for runner in runners {
            print_runner_summary(&runner);
        }
    }

    Ok(())
}

fn print_runner_summary(info: &RunnerInfo) {
    let status = if info.online {
        "online".green()
    } else {
        "offline".red()
    };

    println!("  {} Runner {}", "▸".cyan(), info.runner.id.bold());
    println!("    Status:       {}", status);
    if !info.runner.labels.is_empty() {
        println!("    Labels:       {}", info.runner.labels.join(", "));
    }
    println!(
        "    Registered:   {}",
        format_time(&info.runner.registered_at).dimmed()
    );
    println!(
        "    Last Seen:    {}",
        format_time(&info.runner.last_seen_at).dimmed()
    );
    println!();
}
