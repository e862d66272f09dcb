//! Crate-wide error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur anywhere in the engine.
///
/// Validation failures (bad arguments, duplicate keys, type mismatches) and
/// structural corruption are kept apart: a corrupt file is never something the
/// caller can fix by changing inputs. A search miss is not an error; lookups
/// report found/not-found through their result types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt database: {0}")]
    Corrupt(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key already exists")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("value too long for field `{field}`: {len} bytes (max {max})")]
    ValueTooLong {
        field: String,
        len: usize,
        max: usize,
    },

    #[error("a transaction is already open on this database")]
    TransactionActive,

    #[error("write-ahead file already exists: {0:?}")]
    WalExists(PathBuf),

    #[error("database is read-only")]
    ReadOnly,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
