//! Cached CRM record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::duration_ms;

use super::remote::RemoteRecord;

/// Opaque key-value content of a record.
///
/// Schema validation belongs to the caller; the sync layer only moves it around.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Identifier of the customer that owns a record. Every cache and queue
/// operation is partitioned by owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner id, rejecting blank values and path separators
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(Error::InvalidInput("Owner id cannot be empty".into()));
        }
        if value.contains('/') {
            return Err(Error::InvalidInput(format!(
                "Owner id cannot contain '/': {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Kind of CRM object mirrored by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Customer document (contracts, bills, letters)
    Document,
    /// Support case / ticket
    Case,
}

impl RecordKind {
    /// Every kind the reconciler pulls for a partition
    pub const ALL: [Self; 2] = [Self::Document, Self::Case];

    /// Stable storage and wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Case => "case",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "documents" => Ok(Self::Document),
            "case" | "cases" => Ok(Self::Case),
            other => Err(Error::InvalidInput(format!("Unknown record kind: {other}"))),
        }
    }
}

/// Locally assigned record identifier, using UUID v7 (time-sortable).
///
/// Stable for the lifetime of the cached record, before and after the CRM
/// assigns its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Create a new unique local ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identity of one cached record: owner + kind + local id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub owner_id: OwnerId,
    pub kind: RecordKind,
    pub local_id: LocalId,
}

impl RecordKey {
    #[must_use]
    pub const fn new(owner_id: OwnerId, kind: RecordKind, local_id: LocalId) -> Self {
        Self {
            owner_id,
            kind,
            local_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner_id, self.kind, self.local_id)
    }
}

/// Synchronization state of a cached record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Written locally, not yet queued
    Local,
    /// A write is queued or in flight
    Pending,
    /// Matches the last confirmed CRM state
    Synced,
    /// The CRM changed underneath an unconfirmed local write
    Conflict,
    /// A write was rejected or exhausted its retries
    Failed,
}

impl SyncState {
    /// Stable storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-entering the same state is always allowed (retries, re-staging,
    /// remote overwrites of a synced record).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self as u8 == next as u8 {
            return true;
        }
        matches!(
            (self, next),
            (Self::Local | Self::Synced | Self::Conflict | Self::Failed, Self::Pending)
                | (Self::Pending, Self::Synced | Self::Failed | Self::Conflict)
                | (Self::Conflict, Self::Synced)
        )
    }

    /// Validate a transition, returning the target state on success
    pub fn transition_to(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("Unknown sync state: {other}"))),
        }
    }
}

/// A CRM record as held by the local cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Local identifier (cache key)
    pub local_id: LocalId,
    /// CRM-assigned identifier, absent until the first create is confirmed
    pub remote_id: Option<String>,
    /// Owning customer
    pub owner_id: OwnerId,
    /// Object kind
    pub kind: RecordKind,
    /// Opaque content
    pub payload: Payload,
    /// Monotonic per-record mutation counter
    pub version: i64,
    /// CRM version this record is based on
    pub remote_version: Option<i64>,
    /// Synchronization state
    pub sync_state: SyncState,
    /// Last time the record matched the CRM (Unix ms)
    pub last_synced_at: Option<i64>,
    /// Last local mutation (Unix ms)
    pub local_updated_at: i64,
    /// Last write failure, surfaced for UI/operator visibility
    pub last_error: Option<String>,
    /// Remote snapshot held back while the record is in conflict
    pub staged_remote: Option<RemoteRecord>,
}

impl Record {
    /// Create a new, not yet queued record
    #[must_use]
    pub fn new_local(owner_id: OwnerId, kind: RecordKind, payload: Payload) -> Self {
        Self {
            local_id: LocalId::new(),
            remote_id: None,
            owner_id,
            kind,
            payload,
            version: 1,
            remote_version: None,
            sync_state: SyncState::Local,
            last_synced_at: None,
            local_updated_at: crate::util::now_ms(),
            last_error: None,
            staged_remote: None,
        }
    }

    /// Create a cache entry for a record first seen on the CRM side
    #[must_use]
    pub fn from_remote(remote: &RemoteRecord, now_ms: i64) -> Self {
        Self {
            local_id: LocalId::new(),
            remote_id: Some(remote.id.clone()),
            owner_id: remote.owner_id.clone(),
            kind: remote.kind,
            payload: remote.payload.clone(),
            version: 1,
            remote_version: Some(remote.remote_version),
            sync_state: SyncState::Synced,
            last_synced_at: Some(now_ms),
            local_updated_at: now_ms,
            last_error: None,
            staged_remote: None,
        }
    }

    /// Cache key of this record
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.owner_id.clone(), self.kind, self.local_id)
    }

    /// Whether this record's confirmed state is older than `bound`.
    ///
    /// Only synced records can be stale; anything else carries local intent
    /// that a refresh must not replace.
    #[must_use]
    pub fn is_stale(&self, now_ms: i64, bound: Duration) -> bool {
        if self.sync_state != SyncState::Synced {
            return false;
        }
        self.last_synced_at
            .is_none_or(|synced_at| now_ms.saturating_sub(synced_at) > duration_ms(bound))
    }

    /// Move to `next`, validating the transition
    pub fn transition(&mut self, next: SyncState) -> Result<()> {
        self.sync_state = self.sync_state.transition_to(next)?;
        Ok(())
    }
}
