use std::path::Path;

use crmsync_core::operator::Resolution;
use crmsync_core::RecordKind;

use crate::commands::common::{find_record, open_operator, parse_owner, print_json};
use crate::error::CliError;

pub async fn run_resolve(
    owner: &str,
    kind: RecordKind,
    id: &str,
    resolution: Resolution,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let owner = parse_owner(owner)?;
    let (operator, cache) = open_operator(db_path)?;
    let record = find_record(&cache, &owner, kind, id).await?;
    let resolved = operator.resolve(&record.key(), resolution).await?;

    if as_json {
        return print_json(&resolved);
    }
    println!(
        "{} resolved ({resolution}), now {}",
        resolved.local_id, resolved.sync_state
    );
    Ok(())
}
