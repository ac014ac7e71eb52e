use std::collections::BTreeMap;
use std::path::Path;

use crmsync_core::cache::CacheStore;
use crmsync_core::db::SharedDatabase;
use crmsync_core::queue::{OutboundQueue, QueueStats, RetryPolicy};
use crmsync_core::reconcile::{PartitionCursor, SqliteCursorRepository};
use crmsync_core::OwnerId;
use serde::Serialize;

use crate::commands::common::{format_timestamp, open_database, parse_owner, print_json};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queue: QueueStats,
    pub records: BTreeMap<String, usize>,
    pub cursors: Vec<PartitionCursor>,
}

pub async fn load_status(
    db: &SharedDatabase,
    owner: Option<&OwnerId>,
) -> Result<StatusReport, CliError> {
    let queue = OutboundQueue::new(db.clone(), RetryPolicy::default())
        .stats(owner)
        .await?;
    let records = CacheStore::new(db.clone())
        .state_counts(owner)
        .await?
        .into_iter()
        .map(|(state, count)| (state.to_string(), count))
        .collect();
    let cursors = {
        let db = db.lock().await;
        SqliteCursorRepository::new(db.connection()).list(owner)?
    };

    Ok(StatusReport {
        queue,
        records,
        cursors,
    })
}

pub async fn run_status(owner: Option<&str>, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let owner = owner.map(parse_owner).transpose()?;
    let db = open_database(db_path)?;
    let report = load_status(&db, owner.as_ref()).await?;

    if as_json {
        return print_json(&report);
    }

    println!(
        "Queue: {} queued, {} in flight, {} paused, {} dead letters",
        report.queue.queued, report.queue.in_flight, report.queue.paused, report.queue.dead_letters
    );
    if report.records.is_empty() {
        println!("Records: none cached");
    } else {
        let counts = report
            .records
            .iter()
            .map(|(state, count)| format!("{count} {state}"))
            .collect::<Vec<_>>()
            .join(", ");
        println!("Records: {counts}");
    }
    for cursor in &report.cursors {
        println!(
            "Reconciled {}/{} at {} (cursor {})",
            cursor.owner_id,
            cursor.kind,
            format_timestamp(cursor.last_success_at),
            cursor.cursor.as_ref().map_or("-", |c| c.as_str())
        );
    }
    Ok(())
}
