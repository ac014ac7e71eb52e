//! Data models for crmsync

mod record;
mod remote;
mod sync_event;

pub use record::{LocalId, OwnerId, Payload, Record, RecordKey, RecordKind, SyncState};
pub use remote::{RemotePage, RemoteRecord, SyncCursor};
pub use sync_event::{DeadLetter, EventId, EventStatus, SyncEvent, SyncOperation};
