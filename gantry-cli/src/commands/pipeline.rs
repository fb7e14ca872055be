//! Pipeline command handlers
//!
//! Handles pipeline creation, listing, viewing and deletion, manual runs,
//! cron schedules and the commit checks pipelines report.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::dto::execution::RunPipeline;
use gantry_core::dto::pipeline::{CreatePipeline, SchedulePipeline};

use super::{colorize_status, format_time};
use crate::config::Config;
use crate::id_resolver::resolve_pipeline_id;
use crate::types::parse_key_val;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Register a pipeline for a repository
    Create {
        /// Repository the pipeline builds (e.g. acme/api)
        #[arg(short, long)]
        repo: String,

        /// Identifier unique within the repository
        #[arg(short, long)]
        uid: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Path of the pipeline definition inside the repository
        #[arg(long)]
        config_path: Option<String>,

        /// Branch used by manual and scheduled runs
        #[arg(long)]
        default_branch: Option<String>,
    },
    /// List pipelines
    List {
        /// Only pipelines of this repository
        #[arg(short, long)]
        repo: Option<String>,
    },
    /// Get pipeline details
    Get {
        /// Pipeline ID or unambiguous prefix
        id: String,
    },
    /// Delete a pipeline
    Delete {
        /// Pipeline ID or unambiguous prefix
        id: String,
    },
    /// Start an execution by hand
    Run {
        /// Pipeline ID or unambiguous prefix
        id: String,

        /// Branch to build instead of the default branch
        #[arg(short, long)]
        branch: Option<String>,

        /// Parameters as key=value pairs (e.g., -p target=prod)
        #[arg(short, long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,

        /// Recorded as the principal who started the run
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// Run a pipeline on a cron schedule
    Schedule {
        /// Pipeline ID or unambiguous prefix
        id: String,

        /// Cron expression with a seconds field (e.g. "0 0 3 * * *")
        #[arg(short, long)]
        cron: String,

        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short, long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,
    },
    /// Show the checks reported for a commit
    Checks {
        #[arg(short, long)]
        repo: String,

        /// Commit SHA
        sha: String,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        PipelineCommands::Create {
            repo,
            uid,
            description,
            config_path,
            default_branch,
        } => {
            let req = CreatePipeline {
                repo_id: repo,
                uid,
                description,
                config_path,
                default_branch,
            };
            create_pipeline(&client, req).await
        }
        PipelineCommands::List { repo } => list_pipelines(&client, repo.as_deref()).await,
        PipelineCommands::Get { id } => get_pipeline(&client, &id).await,
        PipelineCommands::Delete { id } => delete_pipeline(&client, &id).await,
        PipelineCommands::Run {
            id,
            branch,
            param,
            by,
        } => {
            let req = RunPipeline {
                branch,
                params: param.into_iter().collect(),
                triggered_by: by,
            };
            run_pipeline(&client, &id, req).await
        }
        PipelineCommands::Schedule {
            id,
            cron,
            branch,
            param,
        } => {
            let req = SchedulePipeline {
                expression: cron,
                branch,
                params: param.into_iter().collect(),
            };
            schedule_pipeline(&client, &id, req).await
        }
        PipelineCommands::Checks { repo, sha } => list_checks(&client, &repo, &sha).await,
    }
}

async fn create_pipeline(client: &OrchestratorClient, req: CreatePipeline) -> Result<()> {
    let pipeline = client.create_pipeline(req).await?;

    println!("{}", "✓ Pipeline created successfully!".green().bold());
    println!("  ID:     {}", pipeline.id.to_string().cyan());
    println!("  Repo:   {}", pipeline.repo_id);
    println!("  UID:    {}", pipeline.uid.bold());
    println!("  Config: {}", pipeline.config_path.dimmed());

    Ok(())
}

async fn list_pipelines(client: &OrchestratorClient, repo: Option<&str>) -> Result<()> {
    let pipelines = client.list_pipelines(repo).await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

async fn get_pipeline(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_pipeline_id(client, id).await?;
    let pipeline = client.get_pipeline(uuid).await?;
    let triggers = client.list_triggers(uuid).await?;

    print_pipeline_details(&pipeline);

    if !triggers.is_empty() {
        println!("\n{}", "Triggers:".bold());
        for trigger in triggers {
            let state = if trigger.enabled {
                "enabled".green()
            } else {
                "disabled".dimmed()
            };
            println!(
                "  {} {} {} {}",
                "▸".cyan(),
                trigger.uid.bold(),
                state,
                trigger.id.to_string().dimmed()
            );
        }
    }

    Ok(())
}

async fn delete_pipeline(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_pipeline_id(client, id).await?;

    client.delete_pipeline(uuid).await?;

    println!(
        "{}",
        format!("✓ Pipeline {} deleted successfully!", uuid)
            .green()
            .bold()
    );

    Ok(())
}

async fn run_pipeline(client: &OrchestratorClient, id: &str, req: RunPipeline) -> Result<()> {
    let uuid = resolve_pipeline_id(client, id).await?;

    let execution = client.run_pipeline(uuid, req).await?;

    println!("{}", "✓ Execution started successfully!".green().bold());
    println!("  Execution ID: {}", execution.id.to_string().cyan());
    println!("  Number:       #{}", execution.number);
    println!("  Ref:          {}", execution.refs.source_ref);
    println!("  Commit:       {}", execution.refs.commit_sha.dimmed());
    println!("  Status:       {}", colorize_status(execution.status.as_str()));

    Ok(())
}

async fn schedule_pipeline(
    client: &OrchestratorClient,
    id: &str,
    req: SchedulePipeline,
) -> Result<()> {
    let uuid = resolve_pipeline_id(client, id).await?;

    let response = client.schedule_pipeline(uuid, req).await?;

    if response.created {
        println!("{}", "✓ Schedule created successfully!".green().bold());
    } else {
        println!("{}", "Schedule already exists.".yellow());
    }
    println!("  Job ID:   {}", response.job.id.cyan());
    println!("  Next run: {}", format_time(&response.job.run_at));

    Ok(())
}

async fn list_checks(client: &OrchestratorClient, repo: &str, sha: &str) -> Result<()> {
    let checks = client.list_checks(repo, sha).await?;

    if checks.is_empty() {
        println!("{}", format!("No checks reported for {}.", sha).yellow());
        return Ok(());
    }

    for check in checks {
        println!(
            "  {} {:<24} {:<8} {}",
            "▸".cyan(),
            check.uid.bold(),
            colorize_status(check.status.as_str()),
            check.summary
        );
        println!("    {}", check.link.dimmed());
    }

    Ok(())
}

fn print_pipeline_summary(pipeline: &Pipeline) {
    println!(
        "  {} {}/{}",
        "▸".cyan(),
        pipeline.repo_id,
        pipeline.uid.bold()
    );
    println!("    ID:      {}", pipeline.id.to_string().dimmed());
    println!("    Runs:    {}", pipeline.seq.to_string().dimmed());
    if let Some(desc) = &pipeline.description {
        println!("    Description: {}", desc.dimmed());
    }
    println!();
}

fn print_pipeline_details(pipeline: &Pipeline) {
    println!("{}", "Pipeline Details:".bold());
    println!("  ID:          {}", pipeline.id.to_string().cyan());
    println!("  Repo:        {}", pipeline.repo_id);
    println!("  UID:         {}", pipeline.uid.bold());
    if let Some(desc) = &pipeline.description {
        println!("  Description: {}", desc);
    }
    println!("  Config:      {}", pipeline.config_path);
    println!("  Branch:      {}", pipeline.default_branch);
    println!("  Runs:        {}", pipeline.seq);
    println!("  Created:     {}", format_time(&pipeline.created_at));
    println!("  Updated:     {}", format_time(&pipeline.updated_at));
}
