//! Job command handlers
//!
//! Inspects the orchestrator's background jobs: cron schedules, recurring
//! maintenance and one-shot work.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::job::{Job, JobSchedule, JobState};

use super::{colorize_status, format_time};
use crate::config::Config;
use crate::types::parse_name;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs in one state
    List {
        /// scheduled, running, succeeded or dead
        #[arg(short, long, default_value = "scheduled", value_parser = parse_name::<JobState>)]
        state: JobState,

        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
    /// Get job details
    Get {
        /// Job ID
        id: String,
    },
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        JobCommands::List { state, limit } => list_jobs(&client, state, limit).await,
        JobCommands::Get { id } => {
            let job = client.get_job(&id).await?;
            print_job_details(&job);
            Ok(())
        }
    }
}

async fn list_jobs(client: &OrchestratorClient, state: JobState, limit: u32) -> Result<()> {
    let jobs = client.list_jobs(state, limit).await?;

    if jobs.is_empty() {
        println!("{}", format!("No {} jobs.", state.as_str()).yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Found {} {} job(s):", jobs.len(), state.as_str()).bold()
    );
    println!();
    for job in jobs {
        print_job_summary(&job);
    }

    Ok(())
}

fn describe_schedule(schedule: &JobSchedule) -> String {
    match schedule {
        JobSchedule::Once => "once".to_string(),
        JobSchedule::Interval { seconds } => format!("every {}s", seconds),
        JobSchedule::Cron { expression } => format!("cron \"{}\"", expression),
    }
}

fn print_job_summary(job: &Job) {
    println!("  {} {} {}", "▸".cyan(), job.id.bold(), job.kind.dimmed());
    println!(
        "    {} next run {}, {}",
        colorize_status(job.state.as_str()),
        format_time(&job.run_at),
        describe_schedule(&job.schedule).dimmed()
    );
    if let Some(error) = &job.last_error {
        println!("    Last error: {}", error.red());
    }
    println!();
}

fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:       {}", job.id.cyan());
    println!("  Kind:     {}", job.kind);
    println!("  State:    {}", colorize_status(job.state.as_str()));
    println!("  Schedule: {}", describe_schedule(&job.schedule));
    println!("  Run at:   {}", format_time(&job.run_at));
    println!("  Attempts: {}/{}", job.attempts, job.max_attempts);
    if let Some(holder) = &job.lease_holder {
        println!("  Held by:  {}", holder);
    }
    if let Some(error) = &job.last_error {
        println!("  Error:    {}", error.red());
    }
    println!("  Created:  {}", format_time(&job.created_at));
    println!("  Updated:  {}", format_time(&job.updated_at));

    if !job.payload.is_null() {
        println!("\n{}", "Payload:".bold());
        println!("{}", serde_json::to_string_pretty(&job.payload).unwrap_or_default());
    }
    if let Some(result) = &job.result {
        println!("\n{}", "Result:".bold());
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_schedule() {
        assert_eq!(describe_schedule(&JobSchedule::Once), "once");
        assert_eq!(
            describe_schedule(&JobSchedule::Interval { seconds: 60 }),
            "every 60s"
        );
        assert_eq!(
            describe_schedule(&JobSchedule::Cron {
                expression: "0 0 3 * * *".to_string()
            }),
            "cron \"0 0 3 * * *\""
        );
    }
}
