//! Outbound write intents and their dead-letter form

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::record::{Payload, RecordKey};

/// Client-generated idempotency key of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh event id (UUID v7)
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

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("Idempotency key must be a UUID: {s}")))
    }
}

/// Kind of write sent to the CRM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
}

impl SyncOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            other => Err(Error::InvalidInput(format!("Unknown operation: {other}"))),
        }
    }
}

/// Queue status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its turn (and for `next_attempt_at`)
    Queued,
    /// Handed to a worker
    InFlight,
    /// Held back until a conflict on its record is resolved
    Paused,
}

impl EventStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Paused => "paused",
        }
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "paused" => Ok(Self::Paused),
            other => Err(Error::InvalidInput(format!("Unknown event status: {other}"))),
        }
    }
}

/// An intended write to the CRM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Idempotency key
    pub event_id: EventId,
    /// Record this write belongs to
    pub record_key: RecordKey,
    /// Create or update
    pub operation: SyncOperation,
    /// Payload as it was when the write was requested
    pub payload: Payload,
    /// Adapter calls made so far
    pub attempt: u32,
    /// Enqueue time (Unix ms)
    pub enqueued_at: i64,
    /// Earliest time the next attempt may start (Unix ms)
    pub next_attempt_at: i64,
    /// Queue status
    pub status: EventStatus,
    /// Error of the last failed attempt
    pub last_error: Option<String>,
}

impl SyncEvent {
    /// Create a new queued event, ready immediately
    #[must_use]
    pub fn new(
        event_id: EventId,
        record_key: RecordKey,
        operation: SyncOperation,
        payload: Payload,
    ) -> Self {
        let now = crate::util::now_ms();
        Self {
            event_id,
            record_key,
            operation,
            payload,
            attempt: 0,
            enqueued_at: now,
            next_attempt_at: now,
            status: EventStatus::Queued,
            last_error: None,
        }
    }
}

/// An event that will not be retried automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The event as it was when it gave up
    pub event: SyncEvent,
    /// When it was dead-lettered (Unix ms)
    pub failed_at: i64,
    /// Why it was dead-lettered
    pub reason: String,
}
