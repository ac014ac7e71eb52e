//! Sync event repository implementation

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // COUNT(*) and attempts are never negative

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::conversion_error;
use crate::error::{Error, Result};
use crate::models::{
    DeadLetter, EventId, EventStatus, LocalId, OwnerId, Payload, RecordKey, RecordKind,
    SyncEvent, SyncOperation,
};

const EVENT_COLUMNS: &str = "event_id, owner_id, kind, local_id, operation, payload, attempt,
        enqueued_at, next_attempt_at, status, last_error";

const KEY_MATCH: &str = "owner_id = ?1 AND kind = ?2 AND local_id = ?3";

/// `SQLite` storage of queued events, the idempotency log and dead letters
pub struct SqliteEventRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEventRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an event from a row laid out as `EVENT_COLUMNS`
    fn parse_event(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
        let event_id: String = row.get(0)?;
        let owner_id: String = row.get(1)?;
        let kind: String = row.get(2)?;
        let local_id: String = row.get(3)?;
        let operation: String = row.get(4)?;
        let payload: String = row.get(5)?;
        let attempt: i64 = row.get(6)?;
        let status: String = row.get(9)?;

        let key = RecordKey::new(
            OwnerId::new(owner_id).map_err(|err| conversion_error(1, err))?,
            kind.parse::<RecordKind>()
                .map_err(|err| conversion_error(2, err))?,
            local_id
                .parse::<LocalId>()
                .map_err(|err| conversion_error(3, err))?,
        );

        Ok(SyncEvent {
            event_id: event_id
                .parse::<EventId>()
                .map_err(|err| conversion_error(0, err))?,
            record_key: key,
            operation: operation
                .parse::<SyncOperation>()
                .map_err(|err| conversion_error(4, err))?,
            payload: serde_json::from_str::<Payload>(&payload)
                .map_err(|err| conversion_error(5, err))?,
            attempt: attempt.max(0) as u32,
            enqueued_at: row.get(7)?,
            next_attempt_at: row.get(8)?,
            status: status
                .parse::<EventStatus>()
                .map_err(|err| conversion_error(9, err))?,
            last_error: row.get(10)?,
        })
    }

    fn parse_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetter> {
        Ok(DeadLetter {
            event: Self::parse_event(row)?,
            failed_at: row.get(11)?,
            reason: row.get(12)?,
        })
    }

    fn key_params(key: &RecordKey) -> [String; 3] {
        [
            key.owner_id.as_str().to_string(),
            key.kind.as_str().to_string(),
            key.local_id.as_str(),
        ]
    }

    /// Whether an event id was ever accepted
    pub fn is_known(&self, event_id: EventId) -> Result<bool> {
        let known = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM event_log WHERE event_id = ?1)",
            params![event_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(known)
    }

    /// Record key an accepted event id was enqueued for
    pub fn logged_key(&self, event_id: EventId) -> Result<Option<RecordKey>> {
        let row = self
            .conn
            .query_row(
                "SELECT owner_id, kind, local_id FROM event_log WHERE event_id = ?1",
                params![event_id.as_str()],
                |row| {
                    let owner_id: String = row.get(0)?;
                    let kind: String = row.get(1)?;
                    let local_id: String = row.get(2)?;
                    Ok((owner_id, kind, local_id))
                },
            )
            .optional()?;

        row.map(|(owner_id, kind, local_id)| -> Result<RecordKey> {
            Ok(RecordKey::new(
                OwnerId::new(owner_id)?,
                kind.parse::<RecordKind>()?,
                local_id.parse::<LocalId>().map_err(|err| {
                    Error::Database(format!("Corrupt event log key: {err}"))
                })?,
            ))
        })
        .transpose()
    }

    /// Append an event to the queue and the idempotency log.
    ///
    /// Returns `false` without touching anything when the id is known.
    pub fn insert(&self, event: &SyncEvent) -> Result<bool> {
        if self.is_known(event.event_id)? {
            return Ok(false);
        }

        let [owner_id, kind, local_id] = Self::key_params(&event.record_key);
        self.conn.execute(
            "INSERT INTO event_log (event_id, owner_id, kind, local_id, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id.as_str(),
                owner_id,
                kind,
                local_id,
                event.enqueued_at
            ],
        )?;
        self.conn.execute(
            &format!(
                "INSERT INTO sync_events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                event.event_id.as_str(),
                owner_id,
                kind,
                local_id,
                event.operation.as_str(),
                serde_json::to_string(&event.payload)?,
                i64::from(event.attempt),
                event.enqueued_at,
                event.next_attempt_at,
                event.status.as_str(),
                event.last_error,
            ],
        )?;
        Ok(true)
    }

    /// Load a live (not dead-lettered) event
    pub fn get(&self, event_id: EventId) -> Result<Option<SyncEvent>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM sync_events WHERE event_id = ?1"),
                params![event_id.as_str()],
                Self::parse_event,
            )
            .optional()?)
    }

    /// Oldest queued, ready event of a partition that heads its key
    pub fn next_ready(&self, owner: &OwnerId, now: i64) -> Result<Option<SyncEvent>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM sync_events e
                     WHERE e.owner_id = ?1 AND e.status = 'queued' AND e.next_attempt_at <= ?2
                       AND e.seq = (
                           SELECT MIN(h.seq) FROM sync_events h
                           WHERE h.owner_id = e.owner_id AND h.kind = e.kind
                             AND h.local_id = e.local_id
                       )
                     ORDER BY e.seq
                     LIMIT 1"
                ),
                params![owner.as_str(), now],
                Self::parse_event,
            )
            .optional()?)
    }

    /// Owners with at least one ready event
    pub fn ready_owners(&self, now: i64) -> Result<Vec<OwnerId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT owner_id FROM sync_events
             WHERE status = 'queued' AND next_attempt_at <= ?1
             ORDER BY owner_id",
        )?;
        let owners = stmt
            .query_map(params![now], |row| {
                let owner: String = row.get(0)?;
                OwnerId::new(owner).map_err(|err| conversion_error(0, err))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(owners)
    }

    /// Events of one key in enqueue order
    pub fn events_for_key(&self, key: &RecordKey) -> Result<Vec<SyncEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM sync_events WHERE {KEY_MATCH} ORDER BY seq"
        ))?;
        let events = stmt
            .query_map(Self::key_params(key), Self::parse_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Number of live events of one key
    pub fn count_for_key(&self, key: &RecordKey) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM sync_events WHERE {KEY_MATCH}"),
            Self::key_params(key),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn set_status(&self, event_id: EventId, status: EventStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_events SET status = ?2 WHERE event_id = ?1",
            params![event_id.as_str(), status.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Put an event back in line after a failed attempt
    pub fn reschedule(
        &self,
        event_id: EventId,
        attempt: u32,
        next_attempt_at: i64,
        last_error: &str,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_events
             SET status = 'queued', attempt = ?2, next_attempt_at = ?3, last_error = ?4
             WHERE event_id = ?1",
            params![
                event_id.as_str(),
                i64::from(attempt),
                next_attempt_at,
                last_error
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, event_id: EventId) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM sync_events WHERE event_id = ?1",
            params![event_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Move events of a key from one status to another
    pub fn set_key_status(
        &self,
        key: &RecordKey,
        from: EventStatus,
        to: EventStatus,
        now: i64,
    ) -> Result<usize> {
        let [owner_id, kind, local_id] = Self::key_params(key);
        let changed = self.conn.execute(
            &format!(
                "UPDATE sync_events
                 SET status = ?5,
                     next_attempt_at = CASE WHEN ?5 = 'queued' THEN MIN(next_attempt_at, ?6)
                                            ELSE next_attempt_at END
                 WHERE {KEY_MATCH} AND status = ?4"
            ),
            params![owner_id, kind, local_id, from.as_str(), to.as_str(), now],
        )?;
        Ok(changed)
    }

    /// Record the failed attempt number on a live event
    pub fn set_attempt(&self, event_id: EventId, attempt: u32, last_error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_events SET attempt = ?2, last_error = ?3 WHERE event_id = ?1",
            params![event_id.as_str(), i64::from(attempt), last_error],
        )?;
        Ok(())
    }

    /// Move every event of a key at or after `from_seq_of` (all events when
    /// `None`) to the dead-letter list
    pub fn dead_letter_key(
        &self,
        key: &RecordKey,
        from_seq_of: Option<EventId>,
        reason: &str,
        failed_at: i64,
    ) -> Result<usize> {
        let [owner_id, kind, local_id] = Self::key_params(key);
        let from = from_seq_of.map(|id| id.as_str());
        let selection = format!(
            "{KEY_MATCH} AND (?4 IS NULL OR seq >= (SELECT seq FROM sync_events WHERE event_id = ?4))"
        );

        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO dead_letters (seq, {EVENT_COLUMNS}, failed_at, reason)
                 SELECT seq, {EVENT_COLUMNS}, ?5, ?6 FROM sync_events WHERE {selection}"
            ),
            params![owner_id, kind, local_id, from, failed_at, reason],
        )?;
        let moved = self.conn.execute(
            &format!("DELETE FROM sync_events WHERE {selection}"),
            params![owner_id, kind, local_id, from],
        )?;
        Ok(moved)
    }

    /// Dead letters of a partition, most recent failure first
    pub fn dead_letters(&self, owner: &OwnerId) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}, failed_at, reason FROM dead_letters
             WHERE owner_id = ?1 ORDER BY failed_at DESC, seq DESC"
        ))?;
        let letters = stmt
            .query_map(params![owner.as_str()], Self::parse_dead_letter)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(letters)
    }

    /// Dead letters of one key in their original order
    pub fn dead_letters_for_key(&self, key: &RecordKey) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}, failed_at, reason FROM dead_letters
             WHERE {KEY_MATCH} ORDER BY seq"
        ))?;
        let letters = stmt
            .query_map(Self::key_params(key), Self::parse_dead_letter)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(letters)
    }

    /// Return a key's dead letters to the queue with a fresh attempt budget
    pub fn requeue_dead_letters(&self, key: &RecordKey, now: i64) -> Result<usize> {
        let [owner_id, kind, local_id] = Self::key_params(key);
        self.conn.execute(
            &format!(
                "INSERT INTO sync_events (seq, {EVENT_COLUMNS})
                 SELECT seq, event_id, owner_id, kind, local_id, operation, payload, 0,
                        enqueued_at, ?4, 'queued', last_error
                 FROM dead_letters WHERE {KEY_MATCH}"
            ),
            params![owner_id, kind, local_id, now],
        )?;
        let moved = self.conn.execute(
            &format!("DELETE FROM dead_letters WHERE {KEY_MATCH}"),
            params![owner_id, kind, local_id],
        )?;
        Ok(moved)
    }

    /// Return every in-flight event to the queue
    pub fn requeue_in_flight(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE sync_events SET status = 'queued' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(changed)
    }

    /// Pause queued events of records that sit in conflict
    pub fn pause_conflicted(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE sync_events SET status = 'paused'
             WHERE status = 'queued' AND EXISTS (
                 SELECT 1 FROM records r
                 WHERE r.owner_id = sync_events.owner_id AND r.kind = sync_events.kind
                   AND r.local_id = sync_events.local_id AND r.sync_state = 'conflict'
             )",
            [],
        )?;
        Ok(changed)
    }

    /// Event counts per status plus dead letters, optionally for one owner
    pub fn stats(&self, owner: Option<&OwnerId>) -> Result<QueueStats> {
        let owner = owner.map(OwnerId::as_str);
        let mut stats = QueueStats::default();

        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM sync_events
             WHERE ?1 IS NULL OR owner_id = ?1 GROUP BY status",
        )?;
        let rows = stmt
            .query_map(params![owner], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in rows {
            let count = count as usize;
            match status.parse::<EventStatus>()? {
                EventStatus::Queued => stats.queued = count,
                EventStatus::InFlight => stats.in_flight = count,
                EventStatus::Paused => stats.paused = count,
            }
        }

        let dead: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE ?1 IS NULL OR owner_id = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        stats.dead_letters = dead as usize;
        Ok(stats)
    }
}

/// Queue depth summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub paused: usize,
    pub dead_letters: usize,
}
