//! crmsync CLI - operate the CRM cache and sync layer
//!
//! Runs the sync daemon and lets an operator inspect and repair local state.

mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::run_conflicts;
use crate::commands::dead_letters::run_dead_letters;
use crate::commands::list::run_list;
use crate::commands::resolve::run_resolve;
use crate::commands::retry::run_retry;
use crate::commands::run::run_sync;
use crate::commands::status::run_status;
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

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crmsync=info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let json = cli.json;

    match cli.command {
        Commands::Run { once, owners } => run_sync(once, &owners, json, &db_path).await?,
        Commands::Status { owner } => run_status(owner.as_deref(), json, &db_path).await?,
        Commands::List {
            owner,
            kind,
            state,
            limit,
        } => {
            run_list(&owner, kind.into(), state.map(Into::into), limit, json, &db_path).await?;
        }
        Commands::DeadLetters { owner } => run_dead_letters(&owner, json, &db_path).await?,
        Commands::Retry { owner, kind, id } => {
            run_retry(&owner, kind.into(), &id, json, &db_path).await?;
        }
        Commands::Resolve {
            owner,
            kind,
            id,
            keep,
        } => {
            run_resolve(&owner, kind.into(), &id, keep.into(), json, &db_path).await?;
        }
        Commands::Conflicts { owner } => run_conflicts(&owner, json, &db_path).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
