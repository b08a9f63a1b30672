//! CLI module for ModelRelay
//!
//! Provides operator commands:
//! - `check`: load and validate configuration, build every provider
//! - `providers` / `roles`: print the wiring
//! - `call`: send one prompt through a role
//! - `health` / `metrics`: optionally probe every role, then report

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod call;
pub mod inspect;
pub mod report;

/// ModelRelay CLI
#[derive(Parser, Debug)]
#[command(name = "modelrelay")]
#[command(about = "Role-based LLM routing with retry, health tracking and fallback")]
#[command(version)]
pub struct Cli {
    /// Extra configuration file layered over the defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and build every enabled provider
    Check,
    /// List registered providers
    Providers,
    /// Print the role table
    Roles,
    /// Send a prompt through a role
    Call(call::CallArgs),
    /// Show provider health
    Health(report::ProbeArgs),
    /// Show token and cost metrics
    Metrics(report::MetricsArgs),
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Some(Commands::Check) => inspect::check(config),
        Some(Commands::Providers) => inspect::providers(config),
        Some(Commands::Roles) => inspect::roles(config),
        Some(Commands::Call(args)) => call::run(config, args).await,
        Some(Commands::Health(args)) => report::health(config, args).await,
        Some(Commands::Metrics(args)) => report::metrics(config, args).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "modelrelay",
            "--json",
            "call",
            "--role",
            "code-generator",
            "--prompt",
            "hello",
            "--stream",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Some(Commands::Call(args)) => {
                assert_eq!(args.role, "code-generator");
                assert_eq!(args.prompt, "hello");
                assert!(args.stream);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_metrics_filters() {
        let cli = Cli::try_parse_from([
            "modelrelay",
            "metrics",
            "--provider",
            "deepseek",
            "--project",
            "alpha",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Metrics(args)) => {
                assert_eq!(args.provider.as_deref(), Some("deepseek"));
                assert_eq!(args.project.as_deref(), Some("alpha"));
                assert!(args.role.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
