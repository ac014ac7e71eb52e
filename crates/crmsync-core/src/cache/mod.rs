//! Local, durable cache of CRM records.
//!
//! The cache is authoritative for reads: it never calls the CRM and never
//! blocks on it. Every mutation is one statement or one transaction under the
//! shared database lock.

mod repository;

use crate::db::SharedDatabase;
use crate::error::Result;
use crate::models::{OwnerId, Record, RecordKey, RecordKind, SyncState};

pub use repository::{RecordRepository, SqliteRecordRepository};

/// Result of a conditional cache write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write went through; carries the stored record
    Swapped(Record),
    /// Somebody else changed the record first; carries what is stored now
    Conflict(Option<Record>),
}

/// Thread-safe cache store over the shared database
#[derive(Clone)]
pub struct CacheStore {
    db: SharedDatabase,
}

impl CacheStore {
    pub const fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Look up a record by local id or CRM id
    pub async fn get(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).find(owner, kind, id)
    }

    /// Look up a record by cache key
    pub async fn get_by_key(&self, key: &RecordKey) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).get(key)
    }

    /// Look up a record by CRM id
    pub async fn find_by_remote_id(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).find_by_remote_id(owner, kind, remote_id)
    }

    /// Point-in-time snapshot of a partition's records of one kind, newest first
    pub async fn list(&self, owner: &OwnerId, kind: RecordKind) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list(owner, kind)
    }

    /// Records of a partition in one state
    pub async fn list_by_state(&self, owner: &OwnerId, state: SyncState) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list_by_state(owner, state)
    }

    /// Atomic upsert; returns the record as stored
    pub async fn put(&self, record: &Record) -> Result<Record> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).put(record)
    }

    /// Conditional replace at `expected_version`
    pub async fn compare_and_swap(
        &self,
        expected_version: i64,
        record: &Record,
    ) -> Result<CasOutcome> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).compare_and_swap(expected_version, record)
    }

    /// Owners that have cached records
    pub async fn owners(&self) -> Result<Vec<OwnerId>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).owners()
    }

    /// Number of records per state
    pub async fn state_counts(&self, owner: Option<&OwnerId>) -> Result<Vec<(SyncState, usize)>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).state_counts(owner)
    }
}
