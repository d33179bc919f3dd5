use thiserror::Error;

use crate::state_machine::JobId;

/// Errors returned across the dispatcher and tracker API.
///
/// Failures of a job itself are never returned here; they are reported via
/// the record's `state` and `last_error`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job already in progress: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Tracker is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let id = JobId::parse("abc").unwrap();
        assert_eq!(
            DispatchError::DuplicateJob(id).to_string(),
            "Job already in progress: abc"
        );
        assert_eq!(
            DispatchError::NotFound("zzz".into()).to_string(),
            "Job not found: zzz"
        );
        assert_eq!(
            DispatchError::Validation("input_key must not be empty".into()).to_string(),
            "Validation error: input_key must not be empty"
        );
    }
}
