use std::path::{Path, PathBuf};

use crmsync_core::cache::CacheStore;
use crmsync_core::config::db_path_from_env;
use crmsync_core::db::{Database, SharedDatabase};
use crmsync_core::models::DeadLetter;
use crmsync_core::operator::Operator;
use crmsync_core::queue::{OutboundQueue, RetryPolicy};
use crmsync_core::{OwnerId, Payload, Record, RecordKind};
use serde::Serialize;

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(db_path_from_env)
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("crmsync.db"),
        |dir| dir.join("crmsync").join("crmsync.db"),
    )
}

pub fn open_database(path: &Path) -> Result<SharedDatabase, CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Database::open(path)?.into_shared())
}

/// Operator over a database; its retry policy only matters to workers
pub fn open_operator(path: &Path) -> Result<(Operator, CacheStore), CliError> {
    let db = open_database(path)?;
    let queue = OutboundQueue::new(db.clone(), RetryPolicy::default());
    Ok((Operator::new(db.clone(), queue), CacheStore::new(db)))
}

pub fn parse_owner(value: &str) -> Result<OwnerId, CliError> {
    if value.trim().is_empty() {
        return Err(CliError::EmptyOwner);
    }
    Ok(OwnerId::new(value)?)
}

pub async fn find_record(
    cache: &CacheStore,
    owner: &OwnerId,
    kind: RecordKind,
    id: &str,
) -> Result<Record, CliError> {
    cache
        .get(owner, kind, id.trim())
        .await?
        .ok_or_else(|| CliError::RecordNotFound(id.trim().to_string()))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let rendered = serde_json::Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = rendered.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_record_lines(records: &[Record], now_ms: i64) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let mut line = format!(
                "{}  {:<8}  {:<12}  v{:<3}  {:<8}  {}",
                record.local_id,
                record.sync_state,
                record.remote_id.as_deref().unwrap_or("-"),
                record.version,
                format_relative_time(record.local_updated_at, now_ms),
                payload_preview(&record.payload, 60)
            );
            if let Some(error) = &record.last_error {
                line.push_str(&format!("\n    ! {error}"));
            }
            line
        })
        .collect()
}

pub fn format_dead_letter_lines(dead_letters: &[DeadLetter]) -> Vec<String> {
    dead_letters
        .iter()
        .map(|dead| {
            format!(
                "{}  {}  {:<6}  attempts={}  {}",
                format_timestamp(dead.failed_at),
                dead.event.record_key,
                dead.event.operation.as_str(),
                dead.event.attempt,
                dead.reason
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}
