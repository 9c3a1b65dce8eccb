use std::io;

use thiserror::Error;

/// Failure taxonomy of the query core.
///
/// Expected absence (a point lookup on pruned or never-seen data) is never an
/// error; those reads return `Ok(None)`. `Integrity` covers inconsistencies
/// that cannot occur in a healthy dataset, such as metadata missing for a
/// message that exists.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("store error: {0}")]
    Store(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("operation was aborted")]
    Aborted,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;
