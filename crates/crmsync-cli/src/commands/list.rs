use std::path::Path;

use crmsync_core::cache::CacheStore;
use crmsync_core::util::now_ms;
use crmsync_core::{OwnerId, Record, RecordKind, SyncState};

use crate::commands::common::{format_record_lines, open_database, parse_owner, print_json};
use crate::error::CliError;

pub async fn list_records(
    cache: &CacheStore,
    owner: &OwnerId,
    kind: RecordKind,
    state: Option<SyncState>,
    limit: usize,
) -> Result<Vec<Record>, CliError> {
    let records = cache.list(owner, kind).await?;
    Ok(records
        .into_iter()
        .filter(|record| state.is_none_or(|state| record.sync_state == state))
        .take(limit)
        .collect())
}

pub async fn run_list(
    owner: &str,
    kind: RecordKind,
    state: Option<SyncState>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let owner = parse_owner(owner)?;
    let cache = CacheStore::new(open_database(db_path)?);
    let records = list_records(&cache, &owner, kind, state, limit).await?;

    if as_json {
        return print_json(&records);
    }

    for line in format_record_lines(&records, now_ms()) {
        println!("{line}");
    }
    Ok(())
}
