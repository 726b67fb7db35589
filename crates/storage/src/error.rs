//! Error kinds shared across the storage core and the command layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds the core produces.
///
/// `Corruption` from the codecs and key composer is never recovered locally:
/// it indicates a bug or on-disk damage and must be surfaced. `SpaceLimit` is
/// a steady-state condition cleared by the size-gate tick.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Auth(String),
    #[error("You can't write against a read only slave.")]
    ReadOnly,
    #[error("reach space limit")]
    SpaceLimit,
    #[error("failed to open db: {0}")]
    DbOpen(String),
    #[error("backup: {0}")]
    DbBackup(String),
    #[error("failed to get WAL iterator: {0}")]
    DbGetWal(String),
    #[error("{0}")]
    NotOk(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::NotOk(e.into_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::NotOk(e.to_string())
    }
}
