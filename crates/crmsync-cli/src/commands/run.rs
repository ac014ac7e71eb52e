use std::path::Path;
use std::sync::Arc;

use crmsync_core::config::{CrmSettings, SyncSettings};
use crmsync_core::crm::HttpCrmAdapter;
use crmsync_core::{OwnerId, SyncCoordinator};

use crate::commands::common::{open_database, parse_owner, print_json};
use crate::error::CliError;

pub async fn run_sync(
    once: bool,
    owners: &[String],
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let settings = SyncSettings::from_env()?;
    let crm = CrmSettings::from_env()?;
    tracing::debug!(?settings, ?crm, "Loaded configuration");

    let adapter = Arc::new(HttpCrmAdapter::new(&crm)?);
    let db = open_database(db_path)?;
    let coordinator = SyncCoordinator::new(db, adapter, settings);
    let owners = owners
        .iter()
        .map(|owner| parse_owner(owner))
        .collect::<Result<Vec<OwnerId>, _>>()?;

    if once {
        return reconcile_once(&coordinator, owners, as_json).await;
    }

    coordinator.start().await?;
    for owner in &owners {
        coordinator.watch_owner(owner).await;
    }
    tracing::info!(db = %db_path.display(), "crmsync running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    coordinator.shutdown().await;
    Ok(())
}

async fn reconcile_once(
    coordinator: &SyncCoordinator,
    mut owners: Vec<OwnerId>,
    as_json: bool,
) -> Result<(), CliError> {
    if owners.is_empty() {
        owners = coordinator.cache().owners().await?;
    }
    if owners.is_empty() {
        return Err(CliError::NoOwners);
    }

    for owner in &owners {
        let report = coordinator.reconcile_now(owner).await?;
        if as_json {
            print_json(&serde_json::json!({ "owner": owner, "report": report }))?;
        } else {
            println!(
                "{owner}: {} fetched, {} new, {} updated, {} conflicts",
                report.fetched,
                report.inserted,
                report.updated,
                report.conflicts.len()
            );
        }
    }
    Ok(())
}
