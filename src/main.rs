// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, KeysCommands};
use depotkeep::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Ingest { archive } => commands::cmd_ingest(&config, &archive).await,
        Commands::Reconcile { title } => commands::cmd_reconcile(&config, title.as_deref()).await,
        Commands::Analyze { title } => commands::cmd_analyze(&config, &title).await,
        Commands::Daemon => commands::cmd_daemon(&config).await,
        Commands::Keys(KeysCommands::Import { file }) => commands::cmd_keys_import(&config, &file),
        Commands::Keys(KeysCommands::Get { depot }) => commands::cmd_keys_get(&config, &depot),
    }
}
