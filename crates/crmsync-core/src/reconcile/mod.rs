//! Inbound reconciliation: pull CRM changes into the cache.
//!
//! Remote snapshots are merged with compare-and-swap against the version read
//! moments earlier, so a concurrent write confirmation is never overwritten.
//! Snapshots that collide with unconfirmed local writes are staged instead of
//! applied.

mod cursor;

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheStore, CasOutcome, RecordRepository, SqliteRecordRepository};
use crate::crm::CrmAdapter;
use crate::db::SharedDatabase;
use crate::error::Result;
use crate::models::{
    EventStatus, OwnerId, Record, RecordKey, RecordKind, RemoteRecord, SyncCursor, SyncState,
};
use crate::queue::SqliteEventRepository;
use crate::util::now_ms;

pub use cursor::{PartitionCursor, SqliteCursorRepository};

const MAX_MERGE_ATTEMPTS: usize = 5;

/// What merging one remote snapshot did to the cache
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// First sighting of the remote record
    Inserted(Record),
    /// Cached copy replaced by the newer remote state
    Updated(Record),
    /// Snapshot not newer than what the cache already reflects
    Unchanged,
    /// Snapshot collided with an unconfirmed local write
    Conflict(Record),
    /// Snapshot held next to a failed local write
    Staged(Record),
    /// Snapshot belongs to a different owner
    Discarded,
}

/// Summary of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub staged: usize,
    pub discarded: usize,
    /// Records that entered or stayed in conflict
    pub conflicts: Vec<RecordKey>,
}

impl ReconcileReport {
    fn count(&mut self, outcome: &MergeOutcome) {
        self.fetched += 1;
        match outcome {
            MergeOutcome::Inserted(_) => self.inserted += 1,
            MergeOutcome::Updated(_) => self.updated += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::Conflict(record) => self.conflicts.push(record.key()),
            MergeOutcome::Staged(_) => self.staged += 1,
            MergeOutcome::Discarded => self.discarded += 1,
        }
    }

    fn absorb(&mut self, other: Self) {
        self.pages += other.pages;
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.staged += other.staged;
        self.discarded += other.discarded;
        self.conflicts.extend(other.conflicts);
    }
}

/// Pulls CRM changes for owner partitions and merges them into the cache
#[derive(Clone)]
pub struct Reconciler {
    db: SharedDatabase,
    cache: CacheStore,
    adapter: Arc<dyn CrmAdapter>,
}

impl Reconciler {
    pub fn new(db: SharedDatabase, adapter: Arc<dyn CrmAdapter>) -> Self {
        Self {
            cache: CacheStore::new(db.clone()),
            db,
            adapter,
        }
    }

    /// Catch one kind of a partition up with the CRM change feed.
    ///
    /// The cursor advances after every fully merged page; an adapter failure
    /// aborts the run and leaves it where the last good page put it.
    pub async fn reconcile(&self, owner: &OwnerId, kind: RecordKind) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut cursor = self.cursor(owner, kind).await?.and_then(|c| c.cursor);

        loop {
            let page = self
                .adapter
                .fetch_changed_since(owner, kind, cursor.as_ref())
                .await?;

            for remote in &page.records {
                let outcome = self.merge(owner, remote).await?;
                report.count(&outcome);
            }
            report.pages += 1;

            let advanced = page.next_cursor.is_some() && page.next_cursor != cursor;
            if page.next_cursor.is_some() {
                cursor.clone_from(&page.next_cursor);
            }
            self.save_cursor(owner, kind, cursor.as_ref()).await?;

            if !page.has_more || !advanced {
                break;
            }
        }

        if report.fetched > 0 {
            tracing::info!(
                %owner,
                %kind,
                fetched = report.fetched,
                inserted = report.inserted,
                updated = report.updated,
                conflicts = report.conflicts.len(),
                "Reconciled partition"
            );
        } else {
            tracing::debug!(%owner, %kind, "Partition already up to date");
        }
        Ok(report)
    }

    /// Reconcile every kind of a partition
    pub async fn reconcile_partition(&self, owner: &OwnerId) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for kind in RecordKind::ALL {
            report.absorb(self.reconcile(owner, kind).await?);
        }
        Ok(report)
    }

    /// Fetch one record from the CRM and merge it.
    ///
    /// Returns the cached record afterwards, or `None` when the CRM does not
    /// know the id.
    pub async fn refresh_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> Result<Option<Record>> {
        let Some(remote) = self.adapter.fetch_record(owner, kind, remote_id).await? else {
            return Ok(None);
        };
        match self.merge(owner, &remote).await? {
            MergeOutcome::Discarded => Ok(None),
            MergeOutcome::Unchanged => self.confirm_unchanged(owner, &remote).await,
            _ => self.cache.find_by_remote_id(owner, kind, &remote.id).await,
        }
    }

    /// Mark a synced record as fresh after the CRM returned the same version.
    ///
    /// A conflicted record with nothing staged gets the snapshot staged, so
    /// its conflict can be settled against the CRM's current state.
    async fn confirm_unchanged(
        &self,
        owner: &OwnerId,
        remote: &RemoteRecord,
    ) -> Result<Option<Record>> {
        let Some(mut record) = self
            .cache
            .find_by_remote_id(owner, remote.kind, &remote.id)
            .await?
        else {
            return Ok(None);
        };

        let expected = record.version;
        match record.sync_state {
            SyncState::Synced if record.remote_version == Some(remote.remote_version) => {
                record.last_synced_at = Some(now_ms());
            }
            SyncState::Conflict if record.staged_remote.is_none() => {
                tracing::debug!(key = %record.key(), remote_version = remote.remote_version, "Staged current CRM version");
                record.staged_remote = Some(remote.clone());
            }
            _ => return Ok(Some(record)),
        }
        match self.cache.compare_and_swap(expected, &record).await? {
            CasOutcome::Swapped(stored) => Ok(Some(stored)),
            CasOutcome::Conflict(current) => Ok(current),
        }
    }

    /// Merge one remote snapshot into a partition's cache
    pub async fn merge(&self, owner: &OwnerId, remote: &RemoteRecord) -> Result<MergeOutcome> {
        if remote.owner_id != *owner {
            tracing::warn!(
                partition = %owner,
                remote_owner = %remote.owner_id,
                remote_id = %remote.id,
                "Discarding remote record from another owner"
            );
            return Ok(MergeOutcome::Discarded);
        }

        for _ in 0..MAX_MERGE_ATTEMPTS {
            let current = self
                .cache
                .find_by_remote_id(owner, remote.kind, &remote.id)
                .await?;
            let Some((expected, next, outcome)) = plan_merge(current, remote) else {
                return Ok(MergeOutcome::Unchanged);
            };

            if let Some(stored) = self.apply(expected, &next, outcome).await? {
                return Ok(stored);
            }
            tracing::debug!(remote_id = %remote.id, "Cache changed during merge, retrying");
        }

        Err(crate::Error::Database(format!(
            "Gave up merging CRM record {} after {MAX_MERGE_ATTEMPTS} concurrent changes",
            remote.id
        )))
    }

    /// Last time a page of this partition and kind was fully merged
    pub async fn last_success_at(&self, owner: &OwnerId, kind: RecordKind) -> Result<Option<i64>> {
        Ok(self.cursor(owner, kind).await?.map(|c| c.last_success_at))
    }

    /// Stored change-feed positions
    pub async fn cursors(&self, owner: Option<&OwnerId>) -> Result<Vec<PartitionCursor>> {
        let db = self.db.lock().await;
        SqliteCursorRepository::new(db.connection()).list(owner)
    }

    async fn cursor(&self, owner: &OwnerId, kind: RecordKind) -> Result<Option<PartitionCursor>> {
        let db = self.db.lock().await;
        SqliteCursorRepository::new(db.connection()).get(owner, kind)
    }

    async fn save_cursor(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        cursor: Option<&SyncCursor>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteCursorRepository::new(db.connection()).save(owner, kind, cursor, now_ms())
    }

    /// Write a planned merge if the record is still at `expected`; a conflict
    /// also pauses the record's queued writes in the same transaction
    async fn apply(
        &self,
        expected: i64,
        next: &Record,
        outcome: PlannedOutcome,
    ) -> Result<Option<MergeOutcome>> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;

        let stored = match SqliteRecordRepository::new(&tx).compare_and_swap(expected, next)? {
            CasOutcome::Swapped(stored) => stored,
            CasOutcome::Conflict(_) => return Ok(None),
        };
        if outcome == PlannedOutcome::Conflict {
            SqliteEventRepository::new(&tx).set_key_status(
                &stored.key(),
                EventStatus::Queued,
                EventStatus::Paused,
                now_ms(),
            )?;
        }
        tx.commit()?;

        if outcome == PlannedOutcome::Conflict {
            tracing::warn!(key = %stored.key(), remote_version = ?next.staged_remote.as_ref().map(|r| r.remote_version), "Remote change collides with a pending local write");
        }
        Ok(Some(match outcome {
            PlannedOutcome::Inserted => MergeOutcome::Inserted(stored),
            PlannedOutcome::Updated => MergeOutcome::Updated(stored),
            PlannedOutcome::Conflict => MergeOutcome::Conflict(stored),
            PlannedOutcome::Staged => MergeOutcome::Staged(stored),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannedOutcome {
    Inserted,
    Updated,
    Conflict,
    Staged,
}

/// Decide how a snapshot changes the cached record; `None` means it doesn't
fn plan_merge(
    current: Option<Record>,
    remote: &RemoteRecord,
) -> Option<(i64, Record, PlannedOutcome)> {
    let now = now_ms();
    let Some(current) = current else {
        return Some((0, Record::from_remote(remote, now), PlannedOutcome::Inserted));
    };

    let known_version = current
        .remote_version
        .max(current.staged_remote.as_ref().map(|s| s.remote_version));
    if known_version.is_some_and(|known| remote.remote_version <= known) {
        return None;
    }

    let expected = current.version;
    let mut next = current;
    let outcome = match next.sync_state {
        SyncState::Synced => {
            next.payload.clone_from(&remote.payload);
            next.remote_version = Some(remote.remote_version);
            next.last_synced_at = Some(now);
            next.staged_remote = None;
            PlannedOutcome::Updated
        }
        SyncState::Pending | SyncState::Conflict => {
            next.staged_remote = Some(remote.clone());
            next.sync_state = SyncState::Conflict;
            PlannedOutcome::Conflict
        }
        SyncState::Failed | SyncState::Local => {
            next.staged_remote = Some(remote.clone());
            PlannedOutcome::Staged
        }
    };
    Some((expected, next, outcome))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::crm::{CrmError, InMemoryCrm};
    use crate::db::Database;
    use crate::models::{EventId, Payload, SyncEvent, SyncOperation};
    use crate::queue::{OutboundQueue, RetryPolicy};

    struct Fixture {
        crm: Arc<InMemoryCrm>,
        reconciler: Reconciler,
        cache: CacheStore,
        queue: OutboundQueue,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap().into_shared();
        let crm = Arc::new(InMemoryCrm::new());
        Fixture {
            reconciler: Reconciler::new(db.clone(), crm.clone()),
            cache: CacheStore::new(db.clone()),
            queue: OutboundQueue::new(db, RetryPolicy::default()),
            crm,
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

    #[tokio::test]
    async fn reconcile_inserts_new_records_and_advances_cursor() {
        let fx = fixture();
        fx.crm.set_page_size(2);
        for subject in ["a", "b", "c"] {
            fx.crm.seed(&owner(), RecordKind::Case, payload(subject));
        }

        let report = fx.reconciler.reconcile(&owner(), RecordKind::Case).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.pages, 2);

        let cached = fx.cache.list(&owner(), RecordKind::Case).await.unwrap();
        assert_eq!(cached.len(), 3);
        assert!(cached.iter().all(|r| r.sync_state == SyncState::Synced));

        let again = fx.reconciler.reconcile(&owner(), RecordKind::Case).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert!(fx
            .reconciler
            .last_success_at(&owner(), RecordKind::Case)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn newer_remote_versions_overwrite_synced_records() {
        let fx = fixture();
        let seeded = fx.crm.seed(&owner(), RecordKind::Document, payload("v1"));
        fx.reconciler
            .reconcile(&owner(), RecordKind::Document)
            .await
            .unwrap();
        let before = fx
            .cache
            .find_by_remote_id(&owner(), RecordKind::Document, &seeded.id)
            .await
            .unwrap()
            .unwrap();

        fx.crm
            .remote_edit(&owner(), RecordKind::Document, &seeded.id, payload("v2"));
        let report = fx
            .reconciler
            .reconcile(&owner(), RecordKind::Document)
            .await
            .unwrap();
        assert_eq!(report.updated, 1);

        let after = fx
            .cache
            .find_by_remote_id(&owner(), RecordKind::Document, &seeded.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.payload["subject"], "v2");
        assert_eq!(after.remote_version, Some(2));
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn redelivered_snapshots_are_ignored() {
        let fx = fixture();
        let seeded = fx.crm.seed(&owner(), RecordKind::Case, payload("v1"));
        fx.reconciler.merge(&owner(), &seeded).await.unwrap();

        let before = fx
            .cache
            .find_by_remote_id(&owner(), RecordKind::Case, &seeded.id)
            .await
            .unwrap()
            .unwrap();
        let outcome = fx.reconciler.merge(&owner(), &seeded).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged);

        let mut older = seeded.clone();
        older.remote_version = 0;
        older.payload = payload("stale");
        assert_eq!(
            fx.reconciler.merge(&owner(), &older).await.unwrap(),
            MergeOutcome::Unchanged
        );

        let after = fx
            .cache
            .find_by_remote_id(&owner(), RecordKind::Case, &seeded.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn remote_change_under_pending_write_becomes_conflict() {
        let fx = fixture();
        let seeded = fx.crm.seed(&owner(), RecordKind::Case, payload("v1"));
        fx.reconciler.merge(&owner(), &seeded).await.unwrap();
        let cached = fx
            .cache
            .find_by_remote_id(&owner(), RecordKind::Case, &seeded.id)
            .await
            .unwrap()
            .unwrap();

        let mut local = cached.clone();
        local.payload = payload("local edit");
        let event = SyncEvent::new(
            EventId::new(),
            local.key(),
            SyncOperation::Update,
            local.payload.clone(),
        );
        fx.queue.enqueue_with_record(&local, event).await.unwrap();

        let remote = fx
            .crm
            .remote_edit(&owner(), RecordKind::Case, &seeded.id, payload("remote edit"))
            .unwrap();
        let outcome = fx.reconciler.merge(&owner(), &remote).await.unwrap();
        let MergeOutcome::Conflict(conflicted) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };

        assert_eq!(conflicted.sync_state, SyncState::Conflict);
        assert_eq!(conflicted.payload["subject"], "local edit");
        assert_eq!(
            conflicted.staged_remote.as_ref().unwrap().payload["subject"],
            "remote edit"
        );
        let events = fx.queue.events_for_key(&conflicted.key()).await.unwrap();
        assert!(events.iter().all(|e| e.status == EventStatus::Paused));
    }

    #[tokio::test]
    async fn foreign_owner_records_are_discarded() {
        let fx = fixture();
        let stranger = OwnerId::new("acct-999").unwrap();
        fx.crm.seed_raw(
            &owner(),
            RemoteRecord {
                id: "crm-x".into(),
                owner_id: stranger.clone(),
                kind: RecordKind::Case,
                payload: payload("not yours"),
                remote_version: 1,
                updated_at: Utc::now(),
            },
        );

        let report = fx.reconciler.reconcile(&owner(), RecordKind::Case).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert!(fx.cache.list(&owner(), RecordKind::Case).await.unwrap().is_empty());
        assert!(fx.cache.list(&stranger, RecordKind::Case).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn adapter_failure_keeps_cursor() {
        let fx = fixture();
        fx.crm.set_page_size(1);
        fx.crm.seed(&owner(), RecordKind::Case, payload("a"));
        fx.crm.seed(&owner(), RecordKind::Case, payload("b"));

        fx.crm.fail_next(1, &CrmError::Transient("boom".into()));
        assert!(fx
            .reconciler
            .reconcile(&owner(), RecordKind::Case)
            .await
            .is_err());
        assert!(fx
            .reconciler
            .last_success_at(&owner(), RecordKind::Case)
            .await
            .unwrap()
            .is_none());

        let report = fx.reconciler.reconcile(&owner(), RecordKind::Case).await.unwrap();
        assert_eq!(report.inserted, 2);
    }

    #[tokio::test]
    async fn refresh_record_fetches_single_record() {
        let fx = fixture();
        let seeded = fx.crm.seed(&owner(), RecordKind::Document, payload("bill"));

        let refreshed = fx
            .reconciler
            .refresh_record(&owner(), RecordKind::Document, &seeded.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.remote_id.as_deref(), Some(seeded.id.as_str()));

        let missing = fx
            .reconciler
            .refresh_record(&owner(), RecordKind::Document, "crm-404")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
