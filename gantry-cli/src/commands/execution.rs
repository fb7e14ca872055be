//! Execution command handlers
//!
//! Lists and inspects executions, requests cancellation and prints or
//! follows step logs.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::execution::Execution;
use gantry_core::domain::log::{LogLine, LogSource};
use gantry_core::dto::execution::{CancelExecution, ExecutionDetail};

use super::{colorize_status, format_time};
use crate::config::Config;
use crate::id_resolver::{resolve_execution_id, resolve_pipeline_id, resolve_step_id};

/// Execution subcommands
#[derive(Subcommand)]
pub enum ExecutionCommands {
    /// List recent executions of a pipeline
    List {
        /// Pipeline ID or unambiguous prefix
        pipeline: String,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Show an execution with its stages and steps
    Get {
        /// Execution ID, or a prefix together with --pipeline
        id: String,

        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Cancel a running execution
    Cancel {
        /// Execution ID, or a prefix together with --pipeline
        id: String,

        #[arg(long)]
        pipeline: Option<String>,

        #[arg(short, long)]
        reason: Option<String>,

        /// Recorded as the principal who canceled
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// Print the log of a step
    Logs {
        /// Step ID, or a prefix together with --execution
        step: String,

        /// Execution ID the step belongs to
        #[arg(short, long)]
        execution: Option<String>,

        /// Pipeline used to resolve an execution prefix
        #[arg(long)]
        pipeline: Option<String>,

        /// Keep streaming until the step finishes
        #[arg(short, long)]
        follow: bool,
    },
}

/// Handle execution commands
pub async fn handle_execution_command(command: ExecutionCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        ExecutionCommands::List { pipeline, limit } => {
            list_executions(&client, &pipeline, limit).await
        }
        ExecutionCommands::Get { id, pipeline } => {
            get_execution(&client, pipeline.as_deref(), &id).await
        }
        ExecutionCommands::Cancel {
            id,
            pipeline,
            reason,
            by,
        } => {
            let req = CancelExecution {
                reason,
                requested_by: by,
            };
            cancel_execution(&client, pipeline.as_deref(), &id, req).await
        }
        ExecutionCommands::Logs {
            step,
            execution,
            pipeline,
            follow,
        } => {
            let execution_id = match execution {
                Some(execution) => {
                    Some(resolve_execution_id(&client, pipeline.as_deref(), &execution).await?)
                }
                None => None,
            };
            let step_id = resolve_step_id(&client, execution_id, &step).await?;

            if follow {
                let seen = client.follow_step_logs(step_id, |line| print_log_line(&line)).await?;
                if seen == 0 {
                    println!("{}", "No output.".yellow());
                }
            } else {
                let lines = client.get_step_logs(step_id).await?;
                if lines.is_empty() {
                    println!("{}", "No output.".yellow());
                }
                for line in &lines {
                    print_log_line(line);
                }
            }
            Ok(())
        }
    }
}

async fn list_executions(client: &OrchestratorClient, pipeline: &str, limit: u32) -> Result<()> {
    let pipeline_id = resolve_pipeline_id(client, pipeline).await?;
    let executions = client.list_executions(pipeline_id, limit).await?;

    if executions.is_empty() {
        println!("{}", "No executions found.".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Found {} execution(s):", executions.len()).bold()
    );
    println!();
    for execution in executions {
        print_execution_summary(&execution);
    }

    Ok(())
}

async fn get_execution(client: &OrchestratorClient, pipeline: Option<&str>, id: &str) -> Result<()> {
    let uuid = resolve_execution_id(client, pipeline, id).await?;
    let detail = client.get_execution(uuid).await?;

    print_execution_details(&detail);

    Ok(())
}

async fn cancel_execution(
    client: &OrchestratorClient,
    pipeline: Option<&str>,
    id: &str,
    req: CancelExecution,
) -> Result<()> {
    let uuid = resolve_execution_id(client, pipeline, id).await?;

    let execution = client.cancel_execution(uuid, req).await?;

    if execution.status.is_terminal() {
        println!(
            "{}",
            format!(
                "Execution #{} already finished ({})",
                execution.number,
                execution.status.as_str()
            )
            .yellow()
        );
    } else {
        println!(
            "{}",
            format!("✓ Cancellation of execution #{} requested", execution.number)
                .green()
                .bold()
        );
    }

    Ok(())
}

fn print_execution_summary(execution: &Execution) {
    println!(
        "  {} #{} {} ({})",
        "▸".cyan(),
        execution.number.to_string().bold(),
        colorize_status(execution.status.as_str()),
        execution.cause
    );
    println!("    ID:      {}", execution.id.to_string().dimmed());
    println!(
        "    Ref:     {} @ {}",
        execution.refs.source_ref,
        short_sha(&execution.refs.commit_sha).dimmed()
    );
    println!("    Created: {}", format_time(&execution.created_at).dimmed());
    println!();
}

fn print_execution_details(detail: &ExecutionDetail) {
    let execution = &detail.execution;

    println!("{}", "Execution Details:".bold());
    println!("  ID:       {}", execution.id.to_string().cyan());
    println!("  Number:   #{}", execution.number);
    println!("  Status:   {}", colorize_status(execution.status.as_str()));
    println!("  Cause:    {}", execution.cause);
    println!("  Ref:      {}", execution.refs.source_ref);
    if execution.refs.target_ref != execution.refs.source_ref {
        println!("  Target:   {}", execution.refs.target_ref);
    }
    println!("  Commit:   {}", execution.refs.commit_sha);
    if let Some(by) = &execution.triggered_by {
        println!("  By:       {}", by);
    }
    if let Some(started) = &execution.started_at {
        println!("  Started:  {}", format_time(started));
    }
    if let Some(finished) = &execution.finished_at {
        println!("  Finished: {}", format_time(finished));
    }
    if let Some(error) = &execution.error {
        println!("  Error:    {}", error.red());
    }
    if !execution.params.is_empty() {
        let mut params: Vec<_> = execution.params.iter().collect();
        params.sort();
        println!("  Params:");
        for (key, value) in params {
            println!("    {}={}", key.cyan(), value);
        }
    }

    println!("\n{}", "Stages:".bold());
    for stage in &detail.stages {
        println!(
            "  {} {} {}",
            "▸".cyan(),
            stage.stage.name.bold(),
            colorize_status(stage.stage.status.as_str())
        );
        if !stage.stage.depends_on.is_empty() {
            println!("    needs: {}", stage.stage.depends_on.join(", ").dimmed());
        }
        if let Some(lease) = &stage.stage.lease {
            println!("    runner: {}", lease.runner_id.dimmed());
        }
        for step in &stage.steps {
            let exit = step
                .exit_code
                .map(|code| format!(" (exit {})", code))
                .unwrap_or_default();
            println!(
                "    - {} {}{} {}",
                step.name,
                colorize_status(step.status.as_str()),
                exit,
                step.id.to_string().dimmed()
            );
            if let Some(error) = &step.error {
                println!("      {}", error.red());
            }
        }
    }
}

fn print_log_line(line: &LogLine) {
    let time = line.timestamp.format("%H:%M:%S").to_string();
    match line.source {
        LogSource::Stdout => println!("{} {}", time.dimmed(), line.message),
        LogSource::Stderr => println!("{} {}", time.dimmed(), line.message.red()),
        LogSource::System => println!("{} {}", time.dimmed(), line.message.cyan()),
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("0123456789abcdef"), "01234567");
        assert_eq!(short_sha("abc"), "abc");
    }
}
