//! Boundary to the remote CRM.
//!
//! Everything that talks to the system of record goes through [`CrmAdapter`].
//! Two implementations ship with the crate: [`HttpCrmAdapter`] for a REST CRM
//! and [`InMemoryCrm`], an in-process CRM with fault injection.

mod error;
mod http;
mod memory;

use async_trait::async_trait;

use crate::models::{EventId, OwnerId, Payload, RecordKind, RemotePage, RemoteRecord, SyncCursor};

pub use error::{CrmError, CrmResult};
pub use http::HttpCrmAdapter;
pub use memory::{CrmCall, CrmCallKind, InMemoryCrm};

/// Remote CRM operations used by the sync layer
#[async_trait]
pub trait CrmAdapter: Send + Sync {
    /// Create a record. Repeating a call with the same idempotency key must
    /// not create a second record.
    async fn create(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        payload: &Payload,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord>;

    /// Update a record, failing with [`CrmError::Conflict`] when the remote
    /// version no longer matches `expected_remote_version`.
    async fn update(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
        payload: &Payload,
        expected_remote_version: Option<i64>,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord>;

    /// One page of records changed after `cursor` (from the beginning when `None`)
    async fn fetch_changed_since(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        cursor: Option<&SyncCursor>,
    ) -> CrmResult<RemotePage>;

    /// Fetch a single record; `Ok(None)` when the CRM does not know it
    async fn fetch_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> CrmResult<Option<RemoteRecord>>;
}
