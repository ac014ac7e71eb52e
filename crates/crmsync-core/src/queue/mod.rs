//! Durable outbound queue of CRM writes.
//!
//! Events for one record are delivered strictly in enqueue order and never
//! two at a time; events for different records proceed independently. Every
//! operation that touches both an event and its record runs in one
//! transaction, so a crash never leaves the two disagreeing.

mod backoff;
mod repository;

use std::time::Duration;

use crate::cache::{RecordRepository, SqliteRecordRepository};
use crate::crm::CrmError;
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    DeadLetter, EventStatus, OwnerId, Record, RecordKey, RemoteRecord, SyncEvent, SyncState,
};
use crate::util::{duration_ms, now_ms};

pub use backoff::RetryPolicy;
pub use repository::{QueueStats, SqliteEventRepository};

/// Result of enqueueing a write together with its record
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// New write accepted; carries the record as stored
    Enqueued(Record),
    /// The idempotency key was seen before; carries the record it produced
    Duplicate(Record),
}

impl EnqueueOutcome {
    #[must_use]
    pub fn into_record(self) -> Record {
        match self {
            Self::Enqueued(record) | Self::Duplicate(record) => record,
        }
    }
}

/// What the queue decided after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The event goes back in line
    Retry {
        /// Attempts made so far
        attempt: u32,
        /// Wait before the next attempt
        delay: Duration,
    },
    /// The event and the rest of its key moved to the dead-letter list
    DeadLettered {
        /// Surfaced on the record as `last_error`
        reason: String,
    },
}

/// Counts of what start-up recovery changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-flight events returned to the queue
    pub redelivered: usize,
    /// Events paused because their record is in conflict
    pub paused: usize,
}

/// Outbound write queue over the shared database
#[derive(Clone)]
pub struct OutboundQueue {
    db: SharedDatabase,
    policy: RetryPolicy,
}

impl OutboundQueue {
    pub const fn new(db: SharedDatabase, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add an event; a known event id is ignored and reported as `false`
    pub async fn enqueue(&self, event: &SyncEvent) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let accepted = SqliteEventRepository::new(&tx).insert(event)?;
        tx.commit()?;

        if accepted {
            tracing::debug!(key = %event.record_key, event = %event.event_id, "Enqueued {}", event.operation.as_str());
        } else {
            tracing::debug!(event = %event.event_id, "Ignored duplicate event");
        }
        Ok(accepted)
    }

    /// Store `record` and enqueue `event` for it atomically.
    ///
    /// The record becomes Pending, unless it currently sits in conflict: then
    /// it stays in conflict and the event waits paused until resolution.
    pub async fn enqueue_with_record(
        &self,
        record: &Record,
        mut event: SyncEvent,
    ) -> Result<EnqueueOutcome> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);
        let records = SqliteRecordRepository::new(&tx);

        if let Some(key) = events.logged_key(event.event_id)? {
            if key.owner_id != record.owner_id {
                tracing::warn!(
                    owner = %record.owner_id,
                    event = %event.event_id,
                    "Idempotency key already used by another owner"
                );
                return Err(Error::InvalidInput(format!(
                    "Idempotency key {} is already in use",
                    event.event_id
                )));
            }
            let existing = records
                .get(&key)?
                .ok_or_else(|| Error::NotFound(format!("Record {key} of event {}", event.event_id)))?;
            tracing::debug!(event = %event.event_id, %key, "Duplicate write ignored");
            return Ok(EnqueueOutcome::Duplicate(existing));
        }

        let mut record = record.clone();
        let in_conflict = records
            .get(&record.key())?
            .is_some_and(|stored| stored.sync_state == SyncState::Conflict);
        if in_conflict {
            record.sync_state = SyncState::Conflict;
            event.status = EventStatus::Paused;
        } else {
            record.sync_state = SyncState::Pending;
        }
        record.last_error = None;
        event.record_key = record.key();

        let stored = records.put(&record)?;
        events.insert(&event)?;
        tx.commit()?;

        tracing::debug!(
            key = %stored.key(),
            event = %event.event_id,
            version = stored.version,
            paused = in_conflict,
            "Enqueued {}",
            event.operation.as_str()
        );
        Ok(EnqueueOutcome::Enqueued(stored))
    }

    /// Claim the next deliverable event of a partition, marking it in flight
    pub async fn dequeue_next(&self, owner: &OwnerId) -> Result<Option<SyncEvent>> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);

        let Some(mut event) = events.next_ready(owner, now_ms())? else {
            return Ok(None);
        };
        events.set_status(event.event_id, EventStatus::InFlight)?;
        tx.commit()?;

        event.status = EventStatus::InFlight;
        Ok(Some(event))
    }

    /// Partitions with work that is due
    pub async fn ready_owners(&self, now: i64) -> Result<Vec<OwnerId>> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).ready_owners(now)
    }

    /// Confirm a delivered event and fold the CRM's answer into the record
    pub async fn acknowledge(&self, event: &SyncEvent, remote: &RemoteRecord) -> Result<Record> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);
        let records = SqliteRecordRepository::new(&tx);
        let key = &event.record_key;

        let mut record = records
            .get(key)?
            .ok_or_else(|| Error::NotFound(format!("Record {key}")))?;
        let was_live = events.delete(event.event_id)?;
        records.fold_shadow(key, &remote.id)?;
        let remaining = events.count_for_key(key)?;
        let now = now_ms();

        record.remote_id = Some(remote.id.clone());
        record.last_error = None;

        if record.sync_state == SyncState::Conflict {
            let echo = record
                .staged_remote
                .as_ref()
                .is_none_or(|staged| staged.remote_version <= remote.remote_version);
            record.remote_version = Some(remote.remote_version);
            if echo {
                record.staged_remote = None;
                record.last_synced_at = Some(now);
                if remaining == 0 {
                    record.payload.clone_from(&remote.payload);
                    record.sync_state = SyncState::Synced;
                } else {
                    record.sync_state = SyncState::Pending;
                    events.set_key_status(key, EventStatus::Paused, EventStatus::Queued, now)?;
                }
            }
        } else if !was_live {
            tracing::warn!(%key, event = %event.event_id, "Acknowledged an event that was discarded in flight");
            record.remote_version = record.remote_version.max(Some(remote.remote_version));
        } else if remaining > 0 {
            record.remote_version = Some(remote.remote_version);
            record.last_synced_at = Some(now);
            record.sync_state = SyncState::Pending;
        } else {
            record.payload.clone_from(&remote.payload);
            record.remote_version = Some(remote.remote_version);
            record.last_synced_at = Some(now);
            record.sync_state = SyncState::Synced;
        }

        let stored = records.put(&record)?;
        tx.commit()?;

        tracing::info!(
            %key,
            remote_id = %remote.id,
            state = %stored.sync_state,
            remaining,
            "Write confirmed by CRM"
        );
        Ok(stored)
    }

    /// Reschedule or dead-letter an event after a failed attempt
    pub async fn record_failure(
        &self,
        event: &SyncEvent,
        error: &CrmError,
    ) -> Result<FailureOutcome> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);
        let records = SqliteRecordRepository::new(&tx);
        let key = &event.record_key;

        let attempt = event.attempt.saturating_add(1);
        let message = error.to_string();
        let now = now_ms();

        if error.is_retryable() && !self.policy.is_exhausted(attempt) {
            let delay = self.policy.delay_for(attempt, error.retry_after());
            events.reschedule(
                event.event_id,
                attempt,
                now.saturating_add(duration_ms(delay)),
                &message,
            )?;
            tx.commit()?;

            tracing::warn!(%key, attempt, ?delay, "CRM write failed, retrying: {message}");
            return Ok(FailureOutcome::Retry { attempt, delay });
        }

        let reason = if error.is_retryable() {
            format!("Gave up after {attempt} attempts: {message}")
        } else {
            format!("Rejected by CRM: {message}")
        };
        events.set_attempt(event.event_id, attempt, &message)?;
        let moved = events.dead_letter_key(key, Some(event.event_id), &reason, now)?;

        if let Some(mut record) = records.get(key)? {
            record.last_error = Some(reason.clone());
            if record.sync_state.can_transition_to(SyncState::Failed) {
                record.sync_state = SyncState::Failed;
            }
            records.put(&record)?;
        }
        tx.commit()?;

        tracing::error!(%key, attempt, moved, "CRM write dead-lettered: {reason}");
        Ok(FailureOutcome::DeadLettered { reason })
    }

    /// Hold an event back because its record changed on the CRM side.
    ///
    /// No attempt is counted; the record moves to conflict and the rest of
    /// its key is paused as well.
    pub async fn pause_for_conflict(&self, event: &SyncEvent, reason: &str) -> Result<Record> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);
        let records = SqliteRecordRepository::new(&tx);
        let key = &event.record_key;

        events.set_status(event.event_id, EventStatus::Paused)?;
        events.set_key_status(key, EventStatus::Queued, EventStatus::Paused, now_ms())?;

        let mut record = records
            .get(key)?
            .ok_or_else(|| Error::NotFound(format!("Record {key}")))?;
        record.transition(SyncState::Conflict)?;
        record.last_error = Some(reason.to_string());
        let stored = records.put(&record)?;
        tx.commit()?;

        tracing::warn!(%key, event = %event.event_id, "Write paused by conflict: {reason}");
        Ok(stored)
    }

    /// Pause every queued event of a key
    pub async fn pause_key(&self, key: &RecordKey) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).set_key_status(
            key,
            EventStatus::Queued,
            EventStatus::Paused,
            now_ms(),
        )
    }

    /// Make every paused event of a key deliverable right away
    pub async fn resume_key(&self, key: &RecordKey) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).set_key_status(
            key,
            EventStatus::Paused,
            EventStatus::Queued,
            now_ms(),
        )
    }

    /// Move every live event of a key to the dead-letter list
    pub async fn discard_key(&self, key: &RecordKey, reason: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let moved =
            SqliteEventRepository::new(db.connection()).dead_letter_key(key, None, reason, now_ms())?;
        if moved > 0 {
            tracing::info!(%key, moved, "Discarded queued writes: {reason}");
        }
        Ok(moved)
    }

    /// Return a key's dead letters to the queue with a fresh attempt budget.
    ///
    /// A Failed record moves back to Pending in the same transaction.
    pub async fn requeue_dead_letters(&self, key: &RecordKey) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);
        let records = SqliteRecordRepository::new(&tx);

        let requeued = events.requeue_dead_letters(key, now_ms())?;
        if requeued > 0 {
            if let Some(mut record) = records.get(key)? {
                if record.sync_state == SyncState::Failed {
                    record.transition(SyncState::Pending)?;
                    record.last_error = None;
                    records.put(&record)?;
                }
            }
        }
        tx.commit()?;

        tracing::info!(%key, requeued, "Requeued dead letters");
        Ok(requeued)
    }

    /// Restore queue invariants after a restart
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let events = SqliteEventRepository::new(&tx);

        let report = RecoveryReport {
            redelivered: events.requeue_in_flight()?,
            paused: events.pause_conflicted()?,
        };
        tx.commit()?;

        if report.redelivered > 0 || report.paused > 0 {
            tracing::info!(
                redelivered = report.redelivered,
                paused = report.paused,
                "Recovered outbound queue"
            );
        }
        Ok(report)
    }

    /// Dead letters of a partition, most recent first
    pub async fn dead_letters(&self, owner: &OwnerId) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).dead_letters(owner)
    }

    /// Dead letters of one record
    pub async fn dead_letters_for_key(&self, key: &RecordKey) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).dead_letters_for_key(key)
    }

    /// Live events of one record in delivery order
    pub async fn events_for_key(&self, key: &RecordKey) -> Result<Vec<SyncEvent>> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).events_for_key(key)
    }

    /// Number of live events of one record
    pub async fn pending_count(&self, key: &RecordKey) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).count_for_key(key)
    }

    /// Queue depth, optionally for one owner
    pub async fn stats(&self, owner: Option<&OwnerId>) -> Result<QueueStats> {
        let db = self.db.lock().await;
        SqliteEventRepository::new(db.connection()).stats(owner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::cache::CacheStore;
    use crate::db::Database;
    use crate::models::{EventId, Payload, RecordKind, SyncOperation};

    struct Fixture {
        queue: OutboundQueue,
        cache: CacheStore,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap().into_shared();
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0);
        Fixture {
            queue: OutboundQueue::new(db.clone(), policy),
            cache: CacheStore::new(db),
        }
    }

    fn owner() -> OwnerId {
        OwnerId::new("acct-001").unwrap()
    }

    fn payload(subject: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("subject".into(), json!(subject));
        payload
    }

    fn remote_for(record: &Record, id: &str, version: i64) -> RemoteRecord {
        RemoteRecord {
            id: id.to_string(),
            owner_id: record.owner_id.clone(),
            kind: record.kind,
            payload: record.payload.clone(),
            remote_version: version,
            updated_at: Utc::now(),
        }
    }

    async fn write(fx: &Fixture, record: &Record, op: SyncOperation) -> (Record, SyncEvent) {
        let event = SyncEvent::new(EventId::new(), record.key(), op, record.payload.clone());
        let stored = fx
            .queue
            .enqueue_with_record(record, event.clone())
            .await
            .unwrap()
            .into_record();
        (stored, event)
    }

    #[tokio::test]
    async fn enqueue_with_record_marks_pending_and_is_idempotent() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let event = SyncEvent::new(
            EventId::new(),
            record.key(),
            SyncOperation::Create,
            record.payload.clone(),
        );

        let first = fx
            .queue
            .enqueue_with_record(&record, event.clone())
            .await
            .unwrap();
        let EnqueueOutcome::Enqueued(stored) = first else {
            panic!("first enqueue must be accepted");
        };
        assert_eq!(stored.sync_state, SyncState::Pending);

        let second = fx.queue.enqueue_with_record(&record, event).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate(stored.clone()));
        assert_eq!(fx.queue.pending_count(&stored.key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_remembers_completed_events() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let (stored, event) = write(&fx, &record, SyncOperation::Create).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        fx.queue
            .acknowledge(&claimed, &remote_for(&stored, "crm-1", 1))
            .await
            .unwrap();

        assert!(!fx.queue.enqueue(&event).await.unwrap());
        assert_eq!(fx.queue.pending_count(&stored.key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dequeue_hands_out_one_event_per_key_in_order() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("v1"));
        let (stored, first) = write(&fx, &record, SyncOperation::Create).await;
        let mut edited = stored.clone();
        edited.payload = payload("v2");
        let (_, second) = write(&fx, &edited, SyncOperation::Update).await;

        let other = Record::new_local(owner(), RecordKind::Document, payload("doc"));
        let (_, third) = write(&fx, &other, SyncOperation::Create).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(claimed.event_id, first.event_id);
        assert_eq!(claimed.status, EventStatus::InFlight);

        let claimed_other = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(claimed_other.event_id, third.event_id);
        assert!(fx.queue.dequeue_next(&owner()).await.unwrap().is_none());

        let confirmed = fx
            .queue
            .acknowledge(&claimed, &remote_for(&stored, "crm-1", 1))
            .await
            .unwrap();
        assert_eq!(confirmed.sync_state, SyncState::Pending);
        assert_eq!(confirmed.remote_id.as_deref(), Some("crm-1"));
        assert_eq!(confirmed.payload["subject"], "v2");

        let next = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(next.event_id, second.event_id);
    }

    #[tokio::test]
    async fn acknowledge_last_event_syncs_record() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let (stored, _) = write(&fx, &record, SyncOperation::Create).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        let mut remote = remote_for(&stored, "crm-9", 1);
        remote.payload.insert("status".into(), json!("New"));
        let confirmed = fx.queue.acknowledge(&claimed, &remote).await.unwrap();

        assert_eq!(confirmed.sync_state, SyncState::Synced);
        assert_eq!(confirmed.remote_version, Some(1));
        assert_eq!(confirmed.payload["status"], "New");
        assert!(confirmed.last_synced_at.is_some());
        assert!(confirmed.version > stored.version);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_dead_letter() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let (stored, _) = write(&fx, &record, SyncOperation::Create).await;
        let error = CrmError::Transient("timeout".into());

        let mut delays = Vec::new();
        for _ in 0..2 {
            let mut event = fx.queue.events_for_key(&stored.key()).await.unwrap()[0].clone();
            event.status = EventStatus::InFlight;
            match fx.queue.record_failure(&event, &error).await.unwrap() {
                FailureOutcome::Retry { delay, .. } => delays.push(delay),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );

        let event = fx.queue.events_for_key(&stored.key()).await.unwrap()[0].clone();
        assert_eq!(event.attempt, 2);
        let outcome = fx.queue.record_failure(&event, &error).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));

        let failed = fx.cache.get_by_key(&stored.key()).await.unwrap().unwrap();
        assert_eq!(failed.sync_state, SyncState::Failed);
        assert!(failed.last_error.unwrap().contains("Gave up after 3 attempts"));

        let letters = fx.queue.dead_letters(&owner()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.attempt, 3);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_the_rest_of_the_key() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("v1"));
        let (stored, _) = write(&fx, &record, SyncOperation::Create).await;
        write(&fx, &stored, SyncOperation::Update).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        let outcome = fx
            .queue
            .record_failure(&claimed, &CrmError::Fatal("subject too long".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));

        assert_eq!(fx.queue.pending_count(&stored.key()).await.unwrap(), 0);
        assert_eq!(
            fx.queue.dead_letters_for_key(&stored.key()).await.unwrap().len(),
            2
        );

        let requeued = fx.queue.requeue_dead_letters(&stored.key()).await.unwrap();
        assert_eq!(requeued, 2);
        let record = fx.cache.get_by_key(&stored.key()).await.unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        let events = fx.queue.events_for_key(&stored.key()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.attempt == 0));
        assert_eq!(events[0].operation, SyncOperation::Create);
    }

    #[tokio::test]
    async fn rate_limit_hint_bounds_the_delay() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        write(&fx, &record, SyncOperation::Create).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        let outcome = fx
            .queue
            .record_failure(
                &claimed,
                &CrmError::RateLimited {
                    retry_after: Duration::from_secs(30),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                attempt: 1,
                delay: Duration::from_secs(30)
            }
        );
        assert!(fx.queue.dequeue_next(&owner()).await.unwrap().is_none());
        assert!(fx.queue.ready_owners(now_ms()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflict_pauses_key_and_recover_restores_invariants() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("v1"));
        let (stored, _) = write(&fx, &record, SyncOperation::Create).await;
        write(&fx, &stored, SyncOperation::Update).await;

        let claimed = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        let conflicted = fx
            .queue
            .pause_for_conflict(&claimed, "remote changed")
            .await
            .unwrap();
        assert_eq!(conflicted.sync_state, SyncState::Conflict);

        let events = fx.queue.events_for_key(&stored.key()).await.unwrap();
        assert!(events.iter().all(|e| e.status == EventStatus::Paused));
        assert_eq!(events[0].attempt, 0);
        assert!(fx.queue.dequeue_next(&owner()).await.unwrap().is_none());

        assert_eq!(fx.queue.resume_key(&stored.key()).await.unwrap(), 2);
        let report = fx.queue.recover().await.unwrap();
        assert_eq!(report.paused, 2);
    }

    #[tokio::test]
    async fn recover_redelivers_in_flight_events() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let (_, event) = write(&fx, &record, SyncOperation::Create).await;

        fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        let report = fx.queue.recover().await.unwrap();
        assert_eq!(report.redelivered, 1);

        let again = fx.queue.dequeue_next(&owner()).await.unwrap().unwrap();
        assert_eq!(again.event_id, event.event_id);
    }

    #[tokio::test]
    async fn discard_key_moves_paused_events_to_dead_letters() {
        let fx = fixture();
        let record = Record::new_local(owner(), RecordKind::Case, payload("a"));
        let (stored, _) = write(&fx, &record, SyncOperation::Create).await;

        assert_eq!(fx.queue.pause_key(&stored.key()).await.unwrap(), 1);
        assert_eq!(
            fx.queue
                .discard_key(&stored.key(), "superseded by remote")
                .await
                .unwrap(),
            1
        );
        let letters = fx.queue.dead_letters(&owner()).await.unwrap();
        assert_eq!(letters[0].reason, "superseded by remote");

        let stats = fx.queue.stats(Some(&owner())).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                dead_letters: 1,
                ..QueueStats::default()
            }
        );
    }
}
