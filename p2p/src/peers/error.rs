//! Error type definitions for the peers module.

use std::io;

use thiserror::Error;

/// Errors while reading or writing the peers file
#[derive(Debug, Error)]
pub enum PeersFileError {
    /// The peers file could not be read or written
    #[error("peers file I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peers file does not hold a well-formed state snapshot
    #[error("malformed peers file: {0}")]
    Decode(String),
    /// The file holds a legacy store, but not a well-formed one
    #[error("malformed legacy peer store: {0}")]
    LegacyDecode(String),
    /// The legacy peer database could not be opened or queried
    #[error("legacy peer database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
