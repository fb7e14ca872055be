//! Gantry CLI
//!
//! Command-line interface for operating the Gantry orchestrator.

mod commands;
mod config;
mod id_resolver;
mod types;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Gantry pipeline orchestrator CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "GANTRY_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        orchestrator_url: cli.orchestrator_url,
    };

    handle_command(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_nested_subcommand() {
        let cli = Cli::try_parse_from([
            "gantry",
            "--orchestrator-url",
            "http://ci:9000",
            "pipeline",
            "run",
            "3f2a",
            "-p",
            "target=prod",
        ])
        .unwrap();
        assert_eq!(cli.orchestrator_url, "http://ci:9000");
        assert!(matches!(cli.command, Commands::Pipeline { .. }));
    }
}
