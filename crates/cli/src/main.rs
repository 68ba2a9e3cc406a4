//! axon CLI: the main entry point.
//!
//! Commands:
//! - `chat`    Interactive chat, or one message with `-m`
//! - `config`  Print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "axon", about = "axon: event-driven LLM agent runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.axon/config.toml
    #[arg(short, long, global = true, env = "AXON_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with an agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Print every agent event as a JSON line instead of plain text
        #[arg(long)]
        events: bool,
    },

    /// Show the effective configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    // RUST_LOG wins, then --verbose, then the configured level.
    let fallback = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { message, events } => commands::chat::run(config, message, events).await?,
        Commands::Config { path } => {
            commands::config_cmd::run(cli.config.as_deref(), &config, path)?
        }
    }

    Ok(())
}
