//! Tally CLI - run and configure cloud sync from the terminal.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::filter::Directive;

use crate::cli::{Cli, Commands, ConfigCommands, SyncCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::config::run_config_endpoint;
use crate::commands::sync::{run_policy, run_status, run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tally=info".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let passphrase = cli.passphrase;

    match cli.command {
        Commands::Sync { command } => match command {
            SyncCommands::Status { json } => run_status(json, &db_path, passphrase).await?,
            SyncCommands::Run { strategy, json } => {
                run_sync(strategy.into(), json, &db_path, passphrase).await?;
            }
            SyncCommands::Policy { policy } => {
                run_policy(policy.into(), &db_path, passphrase).await?;
            }
            SyncCommands::Watch => run_watch(&db_path, passphrase).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Endpoint { url, key, disabled } => {
                run_config_endpoint(&url, &key, !disabled, &db_path, passphrase).await?;
            }
        },
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
