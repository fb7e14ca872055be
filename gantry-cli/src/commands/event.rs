//! Event command handlers
//!
//! Publishes repository events the way a git server would, which starts
//! triggered pipelines and notifies webhooks.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_core::domain::event::{GitEvent, GitEventKind, PullReqEvent, PullReqEventKind};

use crate::config::Config;
use crate::types::parse_name;

/// Event subcommands
#[derive(Subcommand)]
pub enum EventCommands {
    /// Publish a branch or tag change
    Git {
        /// Repository ID (e.g. acme/api)
        #[arg(short, long)]
        repo: String,

        /// branch_created, branch_updated, branch_deleted, tag_created, ...
        #[arg(short, long, default_value = "branch_updated", value_parser = parse_name::<GitEventKind>)]
        kind: GitEventKind,

        /// Full ref name (e.g. refs/heads/main)
        #[arg(long = "ref")]
        ref_name: String,

        /// Previous commit of the ref
        #[arg(long)]
        before: Option<String>,

        /// New commit of the ref
        #[arg(long)]
        after: String,

        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// Publish a pull request change
    Pullreq {
        #[arg(short, long)]
        repo: String,

        /// Pull request number
        #[arg(short, long)]
        number: i64,

        /// created, reopened, branch_updated, closed or merged
        #[arg(short, long, default_value = "created", value_parser = parse_name::<PullReqEventKind>)]
        kind: PullReqEventKind,

        /// Source branch ref
        #[arg(long)]
        source: String,

        /// Target branch ref
        #[arg(long)]
        target: String,

        /// Head commit of the source branch
        #[arg(long)]
        sha: String,

        #[arg(long, env = "USER")]
        by: Option<String>,
    },
}

/// Handle event commands
pub async fn handle_event_command(command: EventCommands, config: &Config) -> Result<()> {
    let client = config.client();

    let published = match command {
        EventCommands::Git {
            repo,
            kind,
            ref_name,
            before,
            after,
            by,
        } => {
            let event = GitEvent {
                repo_id: repo,
                kind,
                ref_name,
                before,
                after,
                principal: by,
            };
            client.publish_git_event(&event).await?
        }
        EventCommands::Pullreq {
            repo,
            number,
            kind,
            source,
            target,
            sha,
            by,
        } => {
            let event = PullReqEvent {
                repo_id: repo,
                number,
                kind,
                source_ref: source,
                target_ref: target,
                sha,
                principal: by,
            };
            client.publish_pullreq_event(&event).await?
        }
    };

    println!("{}", "✓ Event published".green().bold());
    println!(
        "  Position: {}",
        format!("{}:{}", published.stream, published.offset).cyan()
    );

    Ok(())
}
