use std::path::Path;

use crmsync_core::util::now_ms;

use crate::commands::common::{
    format_record_lines, open_operator, parse_owner, payload_preview, print_json,
};
use crate::error::CliError;

pub async fn run_conflicts(owner: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let owner = parse_owner(owner)?;
    let (operator, _) = open_operator(db_path)?;
    let conflicts = operator.conflicts(&owner).await?;

    if as_json {
        return print_json(&conflicts);
    }

    if conflicts.is_empty() {
        println!("No records in conflict.");
        return Ok(());
    }

    let now = now_ms();
    for (record, line) in conflicts.iter().zip(format_record_lines(&conflicts, now)) {
        println!("{line}");
        match &record.staged_remote {
            Some(remote) => println!(
                "    crm v{}: {}",
                remote.remote_version,
                payload_preview(&remote.payload, 60)
            ),
            None => println!("    crm version not fetched yet"),
        }
    }
    Ok(())
}
