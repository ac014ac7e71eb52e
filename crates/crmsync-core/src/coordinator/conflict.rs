//! Automatic re-evaluation of conflicted records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Record, RemoteRecord};
use crate::operator::Resolution;

/// Decides whether a conflict can be settled without an operator
pub trait ConflictResolver: Send + Sync {
    /// `None` leaves the record in conflict for manual resolution.
    ///
    /// `remote` is the staged CRM version, absent when it could not be fetched.
    fn resolve(&self, local: &Record, remote: Option<&RemoteRecord>) -> Option<Resolution>;
}

/// Built-in resolution policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Every conflict waits for an operator
    #[default]
    Manual,
    /// The portal's write always wins
    LocalWins,
    /// The CRM's version always wins
    RemoteWins,
}

impl ConflictPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(Self::Manual),
            "local_wins" => Ok(Self::LocalWins),
            "remote_wins" => Ok(Self::RemoteWins),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict policy: {other}"
            ))),
        }
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, _local: &Record, remote: Option<&RemoteRecord>) -> Option<Resolution> {
        match self {
            Self::Manual => None,
            Self::LocalWins => Some(Resolution::KeepLocal),
            Self::RemoteWins => remote.map(|_| Resolution::AcceptRemote),
        }
    }
}
