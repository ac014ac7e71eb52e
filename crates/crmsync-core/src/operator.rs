//! Operator actions: dead-letter inspection, retries and manual conflict
//! resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::{CacheStore, RecordRepository, SqliteRecordRepository};
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    DeadLetter, EventId, EventStatus, OwnerId, Record, RecordKey, SyncEvent, SyncOperation,
    SyncState,
};
use crate::queue::{OutboundQueue, SqliteEventRepository};
use crate::util::now_ms;

/// How a conflicted record is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Push the local version over the staged remote one
    KeepLocal,
    /// Adopt the staged remote version and drop pending local writes
    AcceptRemote,
}

impl Resolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::AcceptRemote => "accept_remote",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(Self::KeepLocal),
            "accept_remote" | "remote" => Ok(Self::AcceptRemote),
            other => Err(Error::InvalidInput(format!("Unknown resolution: {other}"))),
        }
    }
}

/// Repair surface over the cache and the outbound queue
#[derive(Clone)]
pub struct Operator {
    db: SharedDatabase,
    cache: CacheStore,
    queue: OutboundQueue,
}

impl Operator {
    pub fn new(db: SharedDatabase, queue: OutboundQueue) -> Self {
        Self {
            cache: CacheStore::new(db.clone()),
            db,
            queue,
        }
    }

    pub async fn dead_letters(&self, owner: &OwnerId) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters(owner).await
    }

    pub async fn conflicts(&self, owner: &OwnerId) -> Result<Vec<Record>> {
        self.cache.list_by_state(owner, SyncState::Conflict).await
    }

    pub async fn failed(&self, owner: &OwnerId) -> Result<Vec<Record>> {
        self.cache.list_by_state(owner, SyncState::Failed).await
    }

    /// Send a Failed record's dead-lettered writes again with fresh attempts
    pub async fn retry(&self, key: &RecordKey) -> Result<Record> {
        let record = self
            .cache
            .get_by_key(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Record {key}")))?;
        if record.sync_state != SyncState::Failed {
            return Err(Error::InvalidInput(format!(
                "Record {key} is {}, only failed records can be retried",
                record.sync_state
            )));
        }

        if self.queue.requeue_dead_letters(key).await? == 0 {
            // Nothing left to replay, so push the current payload instead.
            let operation = if record.remote_id.is_some() {
                SyncOperation::Update
            } else {
                SyncOperation::Create
            };
            let event = SyncEvent::new(EventId::new(), key.clone(), operation, record.payload.clone());
            self.queue.enqueue_with_record(&record, event).await?;
        }

        self.cache
            .get_by_key(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Record {key}")))
    }

    /// Settle a record in conflict
    pub async fn resolve(&self, key: &RecordKey, resolution: Resolution) -> Result<Record> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let records = SqliteRecordRepository::new(&tx);
        let events = SqliteEventRepository::new(&tx);
        let now = now_ms();

        let mut record = records
            .get(key)?
            .ok_or_else(|| Error::NotFound(format!("Record {key}")))?;
        if record.sync_state != SyncState::Conflict {
            return Err(Error::InvalidInput(format!(
                "Record {key} is {}, not in conflict",
                record.sync_state
            )));
        }

        match resolution {
            Resolution::KeepLocal => {
                if let Some(staged) = record.staged_remote.take() {
                    record.remote_version = Some(staged.remote_version);
                    record.remote_id.get_or_insert(staged.id);
                }
                record.transition(SyncState::Pending)?;
                record.last_error = None;

                let resumed = events.set_key_status(key, EventStatus::Paused, EventStatus::Queued, now)?;
                if events.count_for_key(key)? == 0 {
                    let operation = if record.remote_id.is_some() {
                        SyncOperation::Update
                    } else {
                        SyncOperation::Create
                    };
                    events.insert(&SyncEvent::new(
                        EventId::new(),
                        key.clone(),
                        operation,
                        record.payload.clone(),
                    ))?;
                }
                tracing::info!(%key, resumed, "Conflict resolved in favour of the local version");
            }
            Resolution::AcceptRemote => {
                let staged = record.staged_remote.take().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Record {key} has no remote version staged; reconcile it first"
                    ))
                })?;
                let reason = format!(
                    "Superseded by CRM version {} during conflict resolution",
                    staged.remote_version
                );
                let discarded = events.dead_letter_key(key, None, &reason, now)?;

                record.payload = staged.payload;
                record.remote_id = Some(staged.id);
                record.remote_version = Some(staged.remote_version);
                record.last_synced_at = Some(now);
                record.last_error = None;
                record.transition(SyncState::Synced)?;
                tracing::info!(%key, discarded, "Conflict resolved in favour of the CRM version");
            }
        }

        record.local_updated_at = now;
        let stored = records.put(&record)?;
        tx.commit()?;
        Ok(stored)
    }
}
