//! Sluice CLI
//!
//! Command-line client for a Sluice sync server: observe live queries,
//! fetch them once, or call server functions.

use std::fs::File;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sluice_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Sluice - live queries over a single WebSocket")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// WebSocket URL of the sync server (overrides the config file)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Auth token to send before any query
    #[arg(long, global = true)]
    token: Option<String>,

    /// HTTP endpoint that returns the WebSocket URL, asked on every connection attempt
    #[arg(long, global = true, value_name = "HTTP_URL")]
    discover: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every update of a live query
    Observe {
        /// Query payload as JSON
        query: String,
        /// Query name
        #[arg(short, long)]
        name: Option<String>,
        /// Exit after this many updates
        #[arg(short, long)]
        count: Option<usize>,
    },
    /// Fetch the current value of a query once
    Get {
        /// Query payload as JSON
        query: String,
        /// Query name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Call a server function
    Call {
        /// Function name
        name: String,
        /// Payload as JSON (defaults to null)
        payload: Option<String>,
    },
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config = Config::load().context("Failed to load configuration")?;

    // Config commands don't need a connection
    if let Commands::Config { command } = &cli.command {
        match command {
            Some(ConfigCommands::Show) | None => commands::config::show(&config, &output),
            Some(ConfigCommands::Path) => commands::config::path(&output),
        }
        return Ok(());
    }

    init_logging(&config);

    let endpoint = commands::sync::endpoint(cli.url, cli.discover, &config)?;
    let timeout = config.request_timeout();
    let client = commands::sync::connect(config, endpoint, cli.token).await?;

    let result = match cli.command {
        Commands::Observe { query, name, count } => {
            let query = commands::sync::parse_query(&query, name)?;
            commands::sync::observe(&client, query, count, &output).await
        }
        Commands::Get { query, name } => {
            let query = commands::sync::parse_query(&query, name)?;
            commands::sync::get(&client, query, timeout, &output).await
        }
        Commands::Call { name, payload } => {
            let payload = commands::sync::parse_payload(payload.as_deref())?;
            commands::sync::call(&client, &name, payload, &output).await
        }
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    client.close().await;
    result
}

/// Initialize logging
///
/// `RUST_LOG` wins; otherwise the configured level applies to the sluice
/// crates. Logs go to stderr, or to `log_file` when configured.
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sluice_core={},sluice_cli={}",
            config.log_level, config.log_level
        ))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match &config.log_file {
        Some(path) => match File::create(path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(file).try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file {:?}: {}", path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_observe() {
        let cli = Cli::parse_from([
            "sluice",
            "--json",
            "observe",
            r#"{"limit":5}"#,
            "--name",
            "feed",
            "--count",
            "2",
            "--url",
            "ws://localhost:9000",
        ]);
        assert!(cli.json);
        assert_eq!(cli.url.as_deref(), Some("ws://localhost:9000"));
        match cli.command {
            Commands::Observe { query, name, count } => {
                assert_eq!(query, r#"{"limit":5}"#);
                assert_eq!(name.as_deref(), Some("feed"));
                assert_eq!(count, Some(2));
            }
            _ => panic!("expected observe"),
        }
    }

    #[test]
    fn test_parse_call_without_payload() {
        let cli = Cli::parse_from(["sluice", "-q", "call", "ping"]);
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Call { ref name, payload: None } if name == "ping"
        ));
    }
}
