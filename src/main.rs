use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hindsight::config::HindsightConfig;
use hindsight::{cli, lifecycle, server};

#[derive(Parser)]
#[command(name = "hindsight", version, about = "Memory worker daemon for coding assistants")]
struct Cli {
    /// Config file (defaults to ~/.hindsight/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker in the foreground
    Worker,
    /// Supervise a worker process (used by `start`)
    Wrapper,
    /// Start the worker in the background, replacing one of a different version
    Start,
    /// Stop the background worker
    Stop,
    /// Stop, then start the background worker
    Restart,
    /// Show whether the worker is running
    Status,
    /// Index all stored rows into the vector backend
    Backfill,
    /// Check the store and print a health report
    Doctor,
    /// Serve MCP tools over stdio, backed by the running worker
    Mcp,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to the configured cache directory
    Download,
}

fn load_config(path: Option<&PathBuf>) -> Result<HindsightConfig> {
    match path {
        Some(p) => HindsightConfig::load_from(p),
        None => HindsightConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // stderr keeps stdout clean for MCP JSON-RPC.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.server.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Worker => server::run_worker(config).await?,
        Command::Wrapper => {
            let mut args: Vec<String> = Vec::new();
            if let Some(path) = &cli.config {
                args.push("--config".into());
                args.push(path.to_string_lossy().into_owned());
            }
            args.push("worker".into());
            let code = lifecycle::wrapper::run_wrapper(&args).await?;
            std::process::exit(code);
        }
        Command::Start => {
            cli::control::start(&config, cli.config.as_deref()).await?;
        }
        Command::Stop => {
            cli::control::stop(&config).await?;
        }
        Command::Restart => cli::control::restart(&config, cli.config.as_deref()).await?,
        Command::Status => cli::control::status(&config).await?,
        Command::Backfill => cli::backfill::backfill(&config).await?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Mcp => server::serve_mcp_stdio(config).await?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.vector).await?,
        },
    }

    Ok(())
}
