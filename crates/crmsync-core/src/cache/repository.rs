//! Record repository implementation

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::db::conversion_error;
use crate::error::{Error, Result};
use crate::models::{LocalId, OwnerId, Payload, Record, RecordKey, RecordKind, SyncState};

use super::CasOutcome;

const SELECT_RECORD: &str = "SELECT owner_id, kind, local_id, remote_id, payload, version,
        remote_version, sync_state, last_synced_at, local_updated_at, last_error, staged_remote
     FROM records";

/// Trait for cached record storage operations
pub trait RecordRepository {
    /// Get a record by its cache key
    fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Get a record whose local id or remote id equals `id`
    fn find(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Result<Option<Record>>;

    /// Get a record by CRM id
    fn find_by_remote_id(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> Result<Option<Record>>;

    /// List a partition's records of one kind, newest first
    fn list(&self, owner: &OwnerId, kind: RecordKind) -> Result<Vec<Record>>;

    /// List a partition's records in one state, newest first
    fn list_by_state(&self, owner: &OwnerId, state: SyncState) -> Result<Vec<Record>>;

    /// Insert or replace a record; the stored version never goes backwards
    fn put(&self, record: &Record) -> Result<Record>;

    /// Replace a record only if its stored version is `expected_version`
    /// (0 for a record that must not exist yet)
    fn compare_and_swap(&self, expected_version: i64, record: &Record) -> Result<CasOutcome>;

    /// Drop a reconciler-inserted duplicate of `keep` that carries the same
    /// CRM id, returning it
    fn fold_shadow(&self, keep: &RecordKey, remote_id: &str) -> Result<Option<Record>>;

    /// Distinct owners with cached records
    fn owners(&self) -> Result<Vec<OwnerId>>;

    /// Number of records per state, optionally for one owner
    fn state_counts(&self, owner: Option<&OwnerId>) -> Result<Vec<(SyncState, usize)>>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &Row<'_>) -> rusqlite::Result<Record> {
        let owner_id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let local_id: String = row.get(2)?;
        let payload: String = row.get(4)?;
        let sync_state: String = row.get(7)?;
        let staged_remote: Option<String> = row.get(11)?;

        Ok(Record {
            local_id: local_id
                .parse::<LocalId>()
                .map_err(|err| conversion_error(2, err))?,
            remote_id: row.get(3)?,
            owner_id: OwnerId::new(owner_id).map_err(|err| conversion_error(0, err))?,
            kind: kind
                .parse::<RecordKind>()
                .map_err(|err| conversion_error(1, err))?,
            payload: serde_json::from_str::<Payload>(&payload)
                .map_err(|err| conversion_error(4, err))?,
            version: row.get(5)?,
            remote_version: row.get(6)?,
            sync_state: sync_state
                .parse::<SyncState>()
                .map_err(|err| conversion_error(7, err))?,
            last_synced_at: row.get(8)?,
            local_updated_at: row.get(9)?,
            last_error: row.get(10)?,
            staged_remote: staged_remote
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .map_err(|err| conversion_error(11, err))?,
        })
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Record>> {
        Ok(self
            .conn
            .query_row(sql, params, Self::parse_record)
            .optional()?)
    }

    fn query_many(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn write(&self, record: &Record, version: i64) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let staged_remote = record
            .staged_remote
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO records (owner_id, kind, local_id, remote_id, payload, version,
                remote_version, sync_state, last_synced_at, local_updated_at, last_error,
                staged_remote)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (owner_id, kind, local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                payload = excluded.payload,
                version = excluded.version,
                remote_version = excluded.remote_version,
                sync_state = excluded.sync_state,
                last_synced_at = excluded.last_synced_at,
                local_updated_at = excluded.local_updated_at,
                last_error = excluded.last_error,
                staged_remote = excluded.staged_remote",
            params![
                record.owner_id.as_str(),
                record.kind.as_str(),
                record.local_id.as_str(),
                record.remote_id,
                payload,
                version,
                record.remote_version,
                record.sync_state.as_str(),
                record.last_synced_at,
                record.local_updated_at,
                record.last_error,
                staged_remote,
            ],
        )?;
        Ok(())
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.query_one(
            &format!("{SELECT_RECORD} WHERE owner_id = ?1 AND kind = ?2 AND local_id = ?3"),
            params![
                key.owner_id.as_str(),
                key.kind.as_str(),
                key.local_id.as_str()
            ],
        )
    }

    fn find(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let id = id.trim();
        if let Ok(local_id) = id.parse::<LocalId>() {
            let key = RecordKey::new(owner.clone(), kind, local_id);
            if let Some(record) = self.get(&key)? {
                return Ok(Some(record));
            }
        }
        self.find_by_remote_id(owner, kind, id)
    }

    fn find_by_remote_id(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> Result<Option<Record>> {
        self.query_one(
            &format!("{SELECT_RECORD} WHERE owner_id = ?1 AND kind = ?2 AND remote_id = ?3"),
            params![owner.as_str(), kind.as_str(), remote_id],
        )
    }

    fn list(&self, owner: &OwnerId, kind: RecordKind) -> Result<Vec<Record>> {
        self.query_many(
            &format!(
                "{SELECT_RECORD} WHERE owner_id = ?1 AND kind = ?2
                 ORDER BY local_updated_at DESC, local_id DESC"
            ),
            params![owner.as_str(), kind.as_str()],
        )
    }

    fn list_by_state(&self, owner: &OwnerId, state: SyncState) -> Result<Vec<Record>> {
        self.query_many(
            &format!(
                "{SELECT_RECORD} WHERE owner_id = ?1 AND sync_state = ?2
                 ORDER BY local_updated_at DESC, local_id DESC"
            ),
            params![owner.as_str(), state.as_str()],
        )
    }

    fn put(&self, record: &Record) -> Result<Record> {
        let version = match self.get(&record.key())? {
            Some(existing) => {
                existing.sync_state.transition_to(record.sync_state)?;
                record.version.max(existing.version + 1)
            }
            None => record.version.max(1),
        };

        self.write(record, version)?;
        Ok(Record {
            version,
            ..record.clone()
        })
    }

    fn compare_and_swap(&self, expected_version: i64, record: &Record) -> Result<CasOutcome> {
        let key = record.key();
        let Some(current) = self.get(&key)? else {
            if expected_version != 0 {
                return Ok(CasOutcome::Conflict(None));
            }
            match self.write(record, 1) {
                Ok(()) => {}
                // Another row already claimed this CRM id.
                Err(Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Ok(CasOutcome::Conflict(None));
                }
                Err(err) => return Err(err),
            }
            return Ok(CasOutcome::Swapped(Record {
                version: 1,
                ..record.clone()
            }));
        };

        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(Some(current)));
        }
        current.sync_state.transition_to(record.sync_state)?;

        let version = expected_version + 1;
        self.write(record, version)?;
        Ok(CasOutcome::Swapped(Record {
            version,
            ..record.clone()
        }))
    }

    fn fold_shadow(&self, keep: &RecordKey, remote_id: &str) -> Result<Option<Record>> {
        let Some(shadow) = self.find_by_remote_id(&keep.owner_id, keep.kind, remote_id)? else {
            return Ok(None);
        };
        if shadow.local_id == keep.local_id {
            return Ok(None);
        }

        self.conn.execute(
            "DELETE FROM records WHERE owner_id = ?1 AND kind = ?2 AND local_id = ?3",
            params![
                shadow.owner_id.as_str(),
                shadow.kind.as_str(),
                shadow.local_id.as_str()
            ],
        )?;
        tracing::debug!(
            shadow = %shadow.key(),
            keep = %keep,
            "Folded duplicate cache row for CRM id {remote_id}"
        );
        Ok(Some(shadow))
    }

    fn owners(&self) -> Result<Vec<OwnerId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT owner_id FROM records ORDER BY owner_id")?;
        let owners = stmt
            .query_map([], |row| {
                let owner: String = row.get(0)?;
                OwnerId::new(owner).map_err(|err| conversion_error(0, err))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(owners)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // COUNT(*) is never negative
    fn state_counts(&self, owner: Option<&OwnerId>) -> Result<Vec<(SyncState, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT sync_state, COUNT(*) FROM records
             WHERE ?1 IS NULL OR owner_id = ?1
             GROUP BY sync_state ORDER BY sync_state",
        )?;
        let counts = stmt
            .query_map(params![owner.map(OwnerId::as_str)], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((
                    state
                        .parse::<SyncState>()
                        .map_err(|err| conversion_error(0, err))?,
                    count as usize,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}
