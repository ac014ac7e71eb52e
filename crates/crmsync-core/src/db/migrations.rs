//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute_batch(stmt)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated cache database to version {version}");
    Ok(())
}

/// Migration to version 1: record cache
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS records (
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_id TEXT NOT NULL,
                remote_id TEXT,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL,
                remote_version INTEGER,
                sync_state TEXT NOT NULL,
                last_synced_at INTEGER,
                local_updated_at INTEGER NOT NULL,
                last_error TEXT,
                staged_remote TEXT,
                PRIMARY KEY (owner_id, kind, local_id)
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_remote
                ON records(owner_id, kind, remote_id) WHERE remote_id IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_records_state ON records(owner_id, sync_state)",
            "CREATE INDEX IF NOT EXISTS idx_records_updated
                ON records(owner_id, kind, local_updated_at DESC)",
        ],
    )
}

/// Migration to version 2: outbound queue, idempotency log and dead letters
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS sync_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_events_key
                ON sync_events(owner_id, kind, local_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_sync_events_ready
                ON sync_events(owner_id, status, next_attempt_at)",
            "CREATE TABLE IF NOT EXISTS event_log (
                event_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_id TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS dead_letters (
                event_id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                failed_at INTEGER NOT NULL,
                reason TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_owner
                ON dead_letters(owner_id, failed_at DESC)",
        ],
    )
}

/// Migration to version 3: reconciler cursors
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        3,
        &["CREATE TABLE IF NOT EXISTS reconcile_cursors (
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                cursor TEXT,
                last_success_at INTEGER NOT NULL,
                PRIMARY KEY (owner_id, kind)
            )"],
    )?;
    tracing::debug!("Schema is at version {CURRENT_VERSION}");
    Ok(())
}
