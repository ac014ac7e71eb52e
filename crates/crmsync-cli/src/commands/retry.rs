use std::path::Path;

use crmsync_core::RecordKind;

use crate::commands::common::{find_record, open_operator, parse_owner, print_json};
use crate::error::CliError;

pub async fn run_retry(
    owner: &str,
    kind: RecordKind,
    id: &str,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let owner = parse_owner(owner)?;
    let (operator, cache) = open_operator(db_path)?;
    let record = find_record(&cache, &owner, kind, id).await?;
    let retried = operator.retry(&record.key()).await?;

    if as_json {
        return print_json(&retried);
    }
    println!("{} queued for retry, now {}", retried.local_id, retried.sync_state);
    Ok(())
}
