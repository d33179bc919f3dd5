use thiserror::Error;

/// Errors raised by compute backend clients.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The call failed in a way that may succeed on retry (throttling,
    /// network trouble, a dropped response).
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The backend refused the request outright (bad image, bad queue).
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The backend has no job with this identifier.
    #[error("unknown backend job: {0}")]
    UnknownJob(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Io(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
