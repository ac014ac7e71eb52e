//! Error types for crmsync-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::crm::CrmError;
use crate::models::SyncState;

/// Result type alias using crmsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in crmsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or event not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record was asked to move through a transition the state machine forbids
    #[error("Invalid sync state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: SyncState,
        /// Requested state
        to: SyncState,
    },

    /// Remote CRM error that could not be absorbed
    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}
