//! Records and pages as returned by the CRM

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{OwnerId, Payload, RecordKind};

/// A record in the CRM's own representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// CRM-assigned identifier
    pub id: String,
    /// Owning customer
    pub owner_id: OwnerId,
    /// Object kind
    pub kind: RecordKind,
    /// Record content
    pub payload: Payload,
    /// CRM-side version, increases on every remote mutation
    pub remote_version: i64,
    /// Last remote modification
    pub updated_at: DateTime<Utc>,
}

/// Opaque change-feed position handed out by the CRM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of the CRM change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePage {
    /// Records changed after the requested cursor
    pub records: Vec<RemoteRecord>,
    /// Cursor to request the following page with
    pub next_cursor: Option<SyncCursor>,
    /// Whether more changes are immediately available
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_record_wire_format() {
        let json = r#"{
            "id": "5001A000001",
            "ownerId": "acct-001",
            "kind": "case",
            "payload": {"subject": "Meter reading", "status": "New"},
            "remoteVersion": 3,
            "updatedAt": "2024-01-01T10:00:00Z"
        }"#;

        let record: RemoteRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "5001A000001");
        assert_eq!(record.owner_id.as_str(), "acct-001");
        assert_eq!(record.kind, RecordKind::Case);
        assert_eq!(record.remote_version, 3);
        assert_eq!(record.payload["status"], "New");
    }

    #[test]
    fn test_remote_page_defaults_has_more() {
        let page: RemotePage =
            serde_json::from_str(r#"{"records": [], "nextCursor": "42"}"#).unwrap();
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, Some(SyncCursor::new("42")));
    }
}
