//! Uniform failure taxonomy of CRM calls

use std::time::Duration;

use thiserror::Error;

/// Result type of every CRM adapter call
pub type CrmResult<T> = std::result::Result<T, CrmError>;

/// Why a CRM call did not succeed.
///
/// Callers branch on the variant, never on the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrmError {
    /// The CRM asked us to slow down
    #[error("CRM rate limit hit, retry after {retry_after:?}")]
    RateLimited {
        /// Minimum wait before the next call
        retry_after: Duration,
    },

    /// The remote record changed since the version the write was based on
    #[error("CRM version conflict: {0}")]
    Conflict(String),

    /// The remote record does not exist
    #[error("CRM record not found")]
    NotFound,

    /// Network failure, timeout or server-side error; worth retrying
    #[error("Transient CRM failure: {0}")]
    Transient(String),

    /// The CRM rejected the request; retrying will not help
    #[error("CRM rejected request: {0}")]
    Fatal(String),
}

impl CrmError {
    /// Whether the queue should retry the call later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Lower bound on the next retry delay requested by the CRM
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
