//! Database layer for crmsync

mod connection;
mod migrations;

pub use connection::{Database, SharedDatabase};

/// Wrap a column value that could not be parsed into a row-mapping error
pub(crate) fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}
