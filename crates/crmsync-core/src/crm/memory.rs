//! In-process CRM with fault injection.
//!
//! Behaves like a well-mannered CRM (idempotent creates, optimistic version
//! checks on update, a cursor-based change feed) and can be told to go
//! offline, fail the next few calls, or answer slowly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{EventId, OwnerId, Payload, RecordKind, RemotePage, RemoteRecord, SyncCursor};

use super::{CrmAdapter, CrmError, CrmResult};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Which adapter operation was called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrmCallKind {
    Create,
    Update,
    FetchChanged,
    FetchRecord,
}

/// One observed adapter call, recorded before faults are applied
#[derive(Debug, Clone)]
pub struct CrmCall {
    pub kind: CrmCallKind,
    pub owner: OwnerId,
    pub record_kind: RecordKind,
    pub remote_id: Option<String>,
    pub idempotency_key: Option<EventId>,
    pub payload: Option<Payload>,
    pub at: Instant,
}

type StoreKey = (OwnerId, RecordKind, String);

#[derive(Debug, Clone)]
struct StoredRecord {
    record: RemoteRecord,
    changed_seq: u64,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<StoreKey, StoredRecord>,
    seq: u64,
    next_id: u64,
    idempotent_results: HashMap<EventId, RemoteRecord>,
    offline: bool,
    scripted_failures: VecDeque<CrmError>,
    latency: Duration,
    page_size: usize,
    calls: Vec<CrmCall>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn injected_failure(&mut self) -> Option<CrmError> {
        if self.offline {
            return Some(CrmError::Transient("CRM unreachable".to_string()));
        }
        self.scripted_failures.pop_front()
    }
}

/// CRM living in process memory
#[derive(Debug)]
pub struct InMemoryCrm {
    state: Mutex<State>,
}

impl Default for InMemoryCrm {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCrm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                page_size: DEFAULT_PAGE_SIZE,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with a transient error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `count` calls with `error`
    pub fn fail_next(&self, count: usize, error: &CrmError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.scripted_failures.push_back(error.clone());
        }
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Limit change-feed pages to `page_size` records
    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    /// Every call observed so far
    pub fn calls(&self) -> Vec<CrmCall> {
        self.lock().calls.clone()
    }

    /// Calls of one kind
    pub fn calls_of(&self, kind: CrmCallKind) -> Vec<CrmCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    /// Current remote state of a record
    pub fn get(&self, owner: &OwnerId, kind: RecordKind, remote_id: &str) -> Option<RemoteRecord> {
        self.lock()
            .records
            .get(&(owner.clone(), kind, remote_id.to_string()))
            .map(|stored| stored.record.clone())
    }

    /// Number of records stored for a partition and kind
    pub fn count(&self, owner: &OwnerId, kind: RecordKind) -> usize {
        self.lock()
            .records
            .keys()
            .filter(|(stored_owner, stored_kind, _)| stored_owner == owner && *stored_kind == kind)
            .count()
    }

    /// Create a record directly on the CRM side, bypassing the sync layer
    pub fn seed(&self, owner: &OwnerId, kind: RecordKind, payload: Payload) -> RemoteRecord {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("crm-{:06}", state.next_id);
        let record = RemoteRecord {
            id,
            owner_id: owner.clone(),
            kind,
            payload,
            remote_version: 1,
            updated_at: Utc::now(),
        };
        insert(&mut state, owner, record.clone());
        record
    }

    /// Place an arbitrary record into a partition's change feed, even one
    /// owned by somebody else
    pub fn seed_raw(&self, partition: &OwnerId, record: RemoteRecord) {
        insert(&mut self.lock(), partition, record);
    }

    /// Edit a record on the CRM side (another user, a back-office job)
    pub fn remote_edit(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
        patch: Payload,
    ) -> Option<RemoteRecord> {
        let mut state = self.lock();
        let seq = state.next_seq();
        let stored = state
            .records
            .get_mut(&(owner.clone(), kind, remote_id.to_string()))?;
        stored.record.payload.extend(patch);
        stored.record.remote_version += 1;
        stored.record.updated_at = Utc::now();
        stored.changed_seq = seq;
        Some(stored.record.clone())
    }

    async fn begin(
        &self,
        kind: CrmCallKind,
        owner: &OwnerId,
        record_kind: RecordKind,
        remote_id: Option<&str>,
        idempotency_key: Option<EventId>,
        payload: Option<&Payload>,
    ) -> CrmResult<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls.push(CrmCall {
            kind,
            owner: owner.clone(),
            record_kind,
            remote_id: remote_id.map(str::to_string),
            idempotency_key,
            payload: payload.cloned(),
            at: Instant::now(),
        });
        state.injected_failure().map_or(Ok(()), Err)
    }
}

fn insert(state: &mut State, partition: &OwnerId, record: RemoteRecord) {
    let changed_seq = state.next_seq();
    state.records.insert(
        (partition.clone(), record.kind, record.id.clone()),
        StoredRecord {
            record,
            changed_seq,
        },
    );
}

#[async_trait]
impl CrmAdapter for InMemoryCrm {
    async fn create(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        payload: &Payload,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord> {
        self.begin(
            CrmCallKind::Create,
            owner,
            kind,
            None,
            Some(idempotency_key),
            Some(payload),
        )
        .await?;

        let mut state = self.lock();
        if let Some(existing) = state.idempotent_results.get(&idempotency_key) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let record = RemoteRecord {
            id: format!("crm-{:06}", state.next_id),
            owner_id: owner.clone(),
            kind,
            payload: payload.clone(),
            remote_version: 1,
            updated_at: Utc::now(),
        };
        insert(&mut state, owner, record.clone());
        state
            .idempotent_results
            .insert(idempotency_key, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
        payload: &Payload,
        expected_remote_version: Option<i64>,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord> {
        self.begin(
            CrmCallKind::Update,
            owner,
            kind,
            Some(remote_id),
            Some(idempotency_key),
            Some(payload),
        )
        .await?;

        let mut state = self.lock();
        if let Some(existing) = state.idempotent_results.get(&idempotency_key) {
            return Ok(existing.clone());
        }

        let seq = state.next_seq();
        let stored = state
            .records
            .get_mut(&(owner.clone(), kind, remote_id.to_string()))
            .ok_or(CrmError::NotFound)?;
        if let Some(expected) = expected_remote_version {
            if stored.record.remote_version != expected {
                return Err(CrmError::Conflict(format!(
                    "expected version {expected}, found {}",
                    stored.record.remote_version
                )));
            }
        }

        stored.record.payload = payload.clone();
        stored.record.remote_version += 1;
        stored.record.updated_at = Utc::now();
        stored.changed_seq = seq;
        let record = stored.record.clone();
        state
            .idempotent_results
            .insert(idempotency_key, record.clone());
        Ok(record)
    }

    async fn fetch_changed_since(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        cursor: Option<&SyncCursor>,
    ) -> CrmResult<RemotePage> {
        self.begin(CrmCallKind::FetchChanged, owner, kind, None, None, None)
            .await?;

        let since = match cursor {
            Some(cursor) => cursor
                .as_str()
                .parse::<u64>()
                .map_err(|_| CrmError::Fatal(format!("Malformed cursor: {}", cursor.as_str())))?,
            None => 0,
        };

        let state = self.lock();
        let mut changed: Vec<&StoredRecord> = state
            .records
            .iter()
            .filter(|((stored_owner, stored_kind, _), stored)| {
                stored_owner == owner && *stored_kind == kind && stored.changed_seq > since
            })
            .map(|(_, stored)| stored)
            .collect();
        changed.sort_by_key(|stored| stored.changed_seq);

        let has_more = changed.len() > state.page_size;
        changed.truncate(state.page_size);
        let next_cursor = changed
            .last()
            .map_or(since, |stored| stored.changed_seq)
            .to_string();

        Ok(RemotePage {
            records: changed.into_iter().map(|stored| stored.record.clone()).collect(),
            next_cursor: Some(SyncCursor::new(next_cursor)),
            has_more,
        })
    }

    async fn fetch_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> CrmResult<Option<RemoteRecord>> {
        self.begin(
            CrmCallKind::FetchRecord,
            owner,
            kind,
            Some(remote_id),
            None,
            None,
        )
        .await?;

        Ok(self.get(owner, kind, remote_id))
    }
}
