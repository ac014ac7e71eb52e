//! Persisted change-feed positions, one per owner and kind

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::conversion_error;
use crate::error::Result;
use crate::models::{OwnerId, RecordKind, SyncCursor};

/// Where the reconciler left off for one partition and kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionCursor {
    pub owner_id: OwnerId,
    pub kind: RecordKind,
    pub cursor: Option<SyncCursor>,
    /// Last fully merged page (Unix ms)
    pub last_success_at: i64,
}

/// `SQLite` storage of reconciler cursors
pub struct SqliteCursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCursorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartitionCursor> {
        let owner_id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let cursor: Option<String> = row.get(2)?;
        Ok(PartitionCursor {
            owner_id: OwnerId::new(owner_id).map_err(|err| conversion_error(0, err))?,
            kind: kind
                .parse::<RecordKind>()
                .map_err(|err| conversion_error(1, err))?,
            cursor: cursor.map(SyncCursor::new),
            last_success_at: row.get(3)?,
        })
    }

    pub fn get(&self, owner: &OwnerId, kind: RecordKind) -> Result<Option<PartitionCursor>> {
        Ok(self
            .conn
            .query_row(
                "SELECT owner_id, kind, cursor, last_success_at FROM reconcile_cursors
                 WHERE owner_id = ?1 AND kind = ?2",
                params![owner.as_str(), kind.as_str()],
                Self::parse_cursor,
            )
            .optional()?)
    }

    /// Store a new position; a `None` cursor keeps the previous one
    pub fn save(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        cursor: Option<&SyncCursor>,
        last_success_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO reconcile_cursors (owner_id, kind, cursor, last_success_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner_id, kind) DO UPDATE SET
                cursor = COALESCE(excluded.cursor, reconcile_cursors.cursor),
                last_success_at = excluded.last_success_at",
            params![
                owner.as_str(),
                kind.as_str(),
                cursor.map(SyncCursor::as_str),
                last_success_at
            ],
        )?;
        Ok(())
    }

    /// Every stored position, optionally for one owner
    pub fn list(&self, owner: Option<&OwnerId>) -> Result<Vec<PartitionCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_id, kind, cursor, last_success_at FROM reconcile_cursors
             WHERE ?1 IS NULL OR owner_id = ?1
             ORDER BY owner_id, kind",
        )?;
        let cursors = stmt
            .query_map(params![owner.map(OwnerId::as_str)], Self::parse_cursor)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cursors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn save_keeps_previous_cursor_when_none() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCursorRepository::new(db.connection());
        let owner = OwnerId::new("acct-001").unwrap();

        assert!(repo.get(&owner, RecordKind::Case).unwrap().is_none());

        repo.save(&owner, RecordKind::Case, Some(&SyncCursor::new("12")), 1_000)
            .unwrap();
        repo.save(&owner, RecordKind::Case, None, 2_000).unwrap();

        let stored = repo.get(&owner, RecordKind::Case).unwrap().unwrap();
        assert_eq!(stored.cursor, Some(SyncCursor::new("12")));
        assert_eq!(stored.last_success_at, 2_000);
        assert_eq!(repo.list(Some(&owner)).unwrap().len(), 1);
        assert!(repo.list(Some(&OwnerId::new("other").unwrap())).unwrap().is_empty());
    }
}
