//! crmsync-core - Core library for crmsync
//!
//! This crate contains the local cache, the outbound write queue, the inbound
//! reconciler and the coordinator that together keep a customer portal's view
//! of CRM records fast, available and eventually consistent with the CRM.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod crm;
pub mod db;
pub mod error;
pub mod models;
pub mod operator;
pub mod queue;
pub mod reconcile;
pub mod util;

pub use coordinator::{ReadResult, RecordStatus, SyncCoordinator};
pub use error::{Error, Result};
pub use models::{
    LocalId, OwnerId, Payload, Record, RecordKey, RecordKind, RemoteRecord, SyncEvent, SyncState,
};
