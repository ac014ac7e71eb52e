//! Public read/write API of the sync layer and the tasks that keep it moving.
//!
//! Reads are answered from the cache, with a bounded on-demand fetch for
//! misses and stale hits. Writes land in the cache as Pending and are
//! delivered by a pool of queue workers. One reconciler task per owner
//! partition pulls CRM changes on a fixed interval or when asked to.

mod conflict;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::CacheStore;
use crate::config::SyncSettings;
use crate::crm::CrmAdapter;
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    DeadLetter, EventId, LocalId, OwnerId, Payload, Record, RecordKey, RecordKind, SyncEvent,
    SyncOperation, SyncState,
};
use crate::operator::Operator;
use crate::queue::{OutboundQueue, QueueStats};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::util::{duration_ms, now_ms};

pub use crate::operator::Resolution;
pub use conflict::{ConflictPolicy, ConflictResolver};

/// Answer of [`SyncCoordinator::read_record`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// The record, possibly older than the staleness bound when `degraded`
    Found { record: Record, degraded: bool },
    /// Neither the cache nor the CRM (within the read timeout) had it
    NotFound,
}

impl ReadResult {
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Found { record, .. } => Some(record),
            Self::NotFound => None,
        }
    }

    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Found { degraded: true, .. })
    }
}

/// Sync status of one record, for UI polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordStatus {
    pub local_id: LocalId,
    pub remote_id: Option<String>,
    pub state: SyncState,
    pub version: i64,
    pub last_synced_at: Option<i64>,
    pub last_error: Option<String>,
    /// Writes of this record still in the queue
    pub queued_writes: usize,
}

#[derive(Default)]
struct Runtime {
    running: bool,
    tasks: Vec<JoinHandle<()>>,
    partitions: HashMap<OwnerId, Arc<Notify>>,
}

struct Inner {
    cache: CacheStore,
    queue: OutboundQueue,
    reconciler: Reconciler,
    operator: Operator,
    adapter: Arc<dyn CrmAdapter>,
    resolver: Arc<dyn ConflictResolver>,
    settings: SyncSettings,
    /// Wakes one idle worker when new work is queued
    wake: Notify,
    /// Rotates the partition a worker starts scanning from
    next_partition: AtomicUsize,
    shutdown: watch::Sender<bool>,
    runtime: Mutex<Runtime>,
    /// Serializes read-modify-write updates of cached payloads
    update_lock: Mutex<()>,
}

/// Facade the portal talks to
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Create a coordinator resolving conflicts with the configured policy
    pub fn new(db: SharedDatabase, adapter: Arc<dyn CrmAdapter>, settings: SyncSettings) -> Self {
        let resolver = Arc::new(settings.conflict_policy);
        Self::with_resolver(db, adapter, settings, resolver)
    }

    /// Create a coordinator with a custom conflict resolver
    pub fn with_resolver(
        db: SharedDatabase,
        adapter: Arc<dyn CrmAdapter>,
        settings: SyncSettings,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        let queue = OutboundQueue::new(db.clone(), settings.retry_policy());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cache: CacheStore::new(db.clone()),
                reconciler: Reconciler::new(db.clone(), adapter.clone()),
                operator: Operator::new(db, queue.clone()),
                queue,
                adapter,
                resolver,
                settings,
                wake: Notify::new(),
                next_partition: AtomicUsize::new(0),
                shutdown,
                runtime: Mutex::new(Runtime::default()),
                update_lock: Mutex::new(()),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn operator(&self) -> &Operator {
        &self.inner.operator
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Read one record by local or CRM id
    pub async fn read_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        id: &str,
    ) -> Result<ReadResult> {
        self.ensure_partition(owner).await;
        let inner = &self.inner;

        match inner.cache.get(owner, kind, id).await? {
            Some(record) if !record.is_stale(now_ms(), inner.settings.staleness) => {
                Ok(ReadResult::Found {
                    record,
                    degraded: false,
                })
            }
            Some(record) => {
                let Some(remote_id) = record.remote_id.clone() else {
                    return Ok(ReadResult::Found {
                        record,
                        degraded: true,
                    });
                };
                Ok(match self.bounded_refresh(owner, kind, &remote_id).await {
                    Some(fresh) => ReadResult::Found {
                        record: fresh,
                        degraded: false,
                    },
                    None => ReadResult::Found {
                        record,
                        degraded: true,
                    },
                })
            }
            None => Ok(self
                .bounded_refresh(owner, kind, id)
                .await
                .map_or(ReadResult::NotFound, |record| ReadResult::Found {
                    record,
                    degraded: false,
                })),
        }
    }

    /// Snapshot of a partition's records of one kind, newest first.
    ///
    /// Asks the partition's reconciler for a refresh, without waiting for it,
    /// when the last successful pull is older than the staleness bound.
    pub async fn list_records(&self, owner: &OwnerId, kind: RecordKind) -> Result<Vec<Record>> {
        let records = self.inner.cache.list(owner, kind).await?;

        let last_success = self.inner.reconciler.last_success_at(owner, kind).await?;
        let bound = duration_ms(self.inner.settings.staleness);
        if last_success.is_none_or(|at| now_ms().saturating_sub(at) > bound) {
            tracing::debug!(%owner, %kind, "Partition is stale, requesting refresh");
            self.request_refresh(owner).await;
        } else {
            self.ensure_partition(owner).await;
        }
        Ok(records)
    }

    /// Create a record. Returns immediately with the record Pending.
    pub async fn write_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        payload: Payload,
        idempotency_key: EventId,
    ) -> Result<Record> {
        let record = Record::new_local(owner.clone(), kind, payload);
        let event = SyncEvent::new(
            idempotency_key,
            record.key(),
            SyncOperation::Create,
            record.payload.clone(),
        );
        let stored = self
            .inner
            .queue
            .enqueue_with_record(&record, event)
            .await?
            .into_record();

        self.ensure_partition(owner).await;
        self.inner.wake.notify_one();
        Ok(stored)
    }

    /// Shallow-merge `patch` into a cached record and queue the update
    pub async fn update_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        id: &str,
        patch: Payload,
        idempotency_key: EventId,
    ) -> Result<Record> {
        let stored = {
            let _guard = self.inner.update_lock.lock().await;
            let mut record = self
                .inner
                .cache
                .get(owner, kind, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Record {owner}/{kind}/{id}")))?;

            record.payload.extend(patch);
            record.local_updated_at = now_ms();
            let event = SyncEvent::new(
                idempotency_key,
                record.key(),
                SyncOperation::Update,
                record.payload.clone(),
            );
            self.inner
                .queue
                .enqueue_with_record(&record, event)
                .await?
                .into_record()
        };

        self.ensure_partition(owner).await;
        self.inner.wake.notify_one();
        Ok(stored)
    }

    /// Current sync status of a record, `None` when it is not cached
    pub async fn record_status(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<RecordStatus>> {
        let Some(record) = self.inner.cache.get(owner, kind, id).await? else {
            return Ok(None);
        };
        let queued_writes = self.inner.queue.pending_count(&record.key()).await?;
        Ok(Some(RecordStatus {
            local_id: record.local_id,
            remote_id: record.remote_id,
            state: record.sync_state,
            version: record.version,
            last_synced_at: record.last_synced_at,
            last_error: record.last_error,
            queued_writes,
        }))
    }

    /// Settle a conflicted record
    pub async fn resolve_conflict(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        id: &str,
        resolution: Resolution,
    ) -> Result<Record> {
        let key = self.key_of(owner, kind, id).await?;
        let record = self.inner.operator.resolve(&key, resolution).await?;
        self.inner.wake.notify_one();
        Ok(record)
    }

    /// Send a Failed record's writes again
    pub async fn retry_failed(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Result<Record> {
        let key = self.key_of(owner, kind, id).await?;
        let record = self.inner.operator.retry(&key).await?;
        self.inner.wake.notify_one();
        Ok(record)
    }

    pub async fn dead_letters(&self, owner: &OwnerId) -> Result<Vec<DeadLetter>> {
        self.inner.operator.dead_letters(owner).await
    }

    pub async fn queue_stats(&self, owner: Option<&OwnerId>) -> Result<QueueStats> {
        self.inner.queue.stats(owner).await
    }

    /// Pull CRM changes for a partition right now and re-evaluate conflicts
    pub async fn reconcile_now(&self, owner: &OwnerId) -> Result<ReconcileReport> {
        self.inner.reconcile_owner(owner).await
    }

    /// Start watching an owner partition and pull its changes soon
    pub async fn watch_owner(&self, owner: &OwnerId) {
        self.request_refresh(owner).await;
    }

    /// Recover the queue and spawn the workers and reconciler tasks
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.running {
            return Ok(());
        }

        let recovered = self.inner.queue.recover().await?;
        self.inner.shutdown.send_replace(false);
        runtime.running = true;

        for id in 0..self.inner.settings.worker_count {
            let handle = tokio::spawn(worker::run(
                id,
                self.inner.clone(),
                self.inner.shutdown.subscribe(),
            ));
            runtime.tasks.push(handle);
        }

        let mut owners = self.inner.cache.owners().await?;
        owners.extend(self.inner.queue.ready_owners(i64::MAX).await?);
        for owner in owners {
            runtime.partitions.entry(owner).or_default();
        }
        let partitions: Vec<_> = runtime
            .partitions
            .iter()
            .map(|(owner, refresh)| (owner.clone(), refresh.clone()))
            .collect();
        for (owner, refresh) in partitions {
            let handle = self.spawn_partition(owner, refresh);
            runtime.tasks.push(handle);
        }

        tracing::info!(
            workers = self.inner.settings.worker_count,
            partitions = runtime.partitions.len(),
            redelivered = recovered.redelivered,
            "Sync coordinator started"
        );
        Ok(())
    }

    /// Stop every task and wait for in-progress work to finish
    pub async fn shutdown(&self) {
        let tasks = {
            let mut runtime = self.inner.runtime.lock().await;
            if !runtime.running {
                return;
            }
            runtime.running = false;
            std::mem::take(&mut runtime.tasks)
        };

        self.inner.shutdown.send_replace(true);
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!("Sync task ended abnormally: {err}");
            }
        }
        tracing::info!("Sync coordinator stopped");
    }

    /// Register an owner partition, spawning its reconciler when running
    async fn ensure_partition(&self, owner: &OwnerId) -> Arc<Notify> {
        let mut runtime = self.inner.runtime.lock().await;
        if let Some(refresh) = runtime.partitions.get(owner) {
            return refresh.clone();
        }

        let refresh = Arc::new(Notify::new());
        runtime.partitions.insert(owner.clone(), refresh.clone());
        if runtime.running {
            let handle = self.spawn_partition(owner.clone(), refresh.clone());
            runtime.tasks.push(handle);
            tracing::debug!(%owner, "Spawned reconciler for new partition");
        }
        refresh
    }

    async fn request_refresh(&self, owner: &OwnerId) {
        self.ensure_partition(owner).await.notify_one();
    }

    fn spawn_partition(&self, owner: OwnerId, refresh: Arc<Notify>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                    () = refresh.notified() => {}
                }
                if let Err(err) = inner.reconcile_owner(&owner).await {
                    tracing::warn!(%owner, "Reconciliation failed: {err}");
                }
            }
        })
    }

    /// Fetch one record from the CRM on its own task, waiting at most the
    /// read timeout. A late answer still lands in the cache.
    async fn bounded_refresh(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Option<Record> {
        let reconciler = self.inner.reconciler.clone();
        let (task_owner, task_id) = (owner.clone(), id.to_string());
        let fetch = tokio::spawn(async move {
            reconciler
                .refresh_record(&task_owner, kind, &task_id)
                .await
        });

        match tokio::time::timeout(self.inner.settings.read_timeout, fetch).await {
            Ok(Ok(Ok(record))) => record,
            Ok(Ok(Err(err))) => {
                tracing::warn!(%owner, %kind, id, "On-demand fetch failed: {err}");
                None
            }
            Ok(Err(err)) => {
                tracing::error!(%owner, %kind, id, "On-demand fetch task failed: {err}");
                None
            }
            Err(_) => {
                tracing::warn!(
                    %owner,
                    %kind,
                    id,
                    timeout = ?self.inner.settings.read_timeout,
                    "On-demand fetch timed out"
                );
                None
            }
        }
    }

    async fn key_of(&self, owner: &OwnerId, kind: RecordKind, id: &str) -> Result<RecordKey> {
        self.inner
            .cache
            .get(owner, kind, id)
            .await?
            .map(|record| record.key())
            .ok_or_else(|| Error::NotFound(format!("Record {owner}/{kind}/{id}")))
    }
}

impl Inner {
    async fn reconcile_owner(&self, owner: &OwnerId) -> Result<ReconcileReport> {
        let report = self.reconciler.reconcile_partition(owner).await?;
        for key in &report.conflicts {
            self.reevaluate_conflict(key).await?;
        }
        Ok(report)
    }

    /// Offer a conflicted record to the resolver; settle it if it decides
    async fn reevaluate_conflict(&self, key: &RecordKey) -> Result<Option<Record>> {
        let Some(record) = self.cache.get_by_key(key).await? else {
            return Ok(None);
        };
        if record.sync_state != SyncState::Conflict {
            return Ok(None);
        }
        let Some(resolution) = self
            .resolver
            .resolve(&record, record.staged_remote.as_ref())
        else {
            tracing::info!(%key, "Conflict awaits manual resolution");
            return Ok(None);
        };

        let resolved = self.operator.resolve(key, resolution).await?;
        tracing::info!(%key, %resolution, "Conflict resolved automatically");
        self.wake.notify_one();
        Ok(Some(resolved))
    }
}

#[cfg(test)]
mod tests;
