//! Errors raised by artifact store clients.
//!
//! Clients surface these raw: no retries, no wrapping. Retry policy lives in
//! the job tracker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists under the given key or prefix.
    #[error("no object under {0:?}")]
    NotFound(String),

    /// The key is empty, absolute, or escapes the store.
    #[error("invalid key {0:?}")]
    InvalidKey(String),

    /// The store rejected or dropped the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Reject keys that are empty, absolute, or contain `.`/`..` segments.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment == "." || segment == "..");
    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
