use std::io;

use crmsync_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] crmsync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Owner id cannot be empty")]
    EmptyOwner,
    #[error("Record not found for id: {0}")]
    RecordNotFound(String),
    #[error("No owners to reconcile. Pass --owner or sync some records first.")]
    NoOwners,
}
