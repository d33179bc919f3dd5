use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::JobRecord;

/// Lifecycle states of a transcription job.
///
/// ```text
/// Pending → Staging → Submitted → Running → Succeeded | Failed
///              ↑          │          │
///              └──────────┴──────────┘  (retry, attempt_count + 1)
/// any non-terminal → TimedOut | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Staging,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Staging => write!(f, "STAGING"),
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::TimedOut => write!(f, "TIMED_OUT"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// The result of applying a state change to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved forward along the lifecycle.
    Next(JobState),
    /// Looped back to `Staging` for a new compute attempt.
    Retry { attempt: u32 },
    /// Reached a terminal state.
    Complete(JobState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobState, to: JobState },

    #[error("no attempts left ({used} of {max} used)")]
    AttemptsExhausted { used: u32, max: u32 },
}

/// Validates and applies state changes to a [`JobRecord`].
pub struct StateMachine;

impl StateMachine {
    /// Whether `from -> to` is an edge of the lifecycle graph.
    pub fn is_legal(from: JobState, to: JobState) -> bool {
        use JobState::*;
        if from.is_terminal() {
            return false;
        }
        match to {
            TimedOut | Cancelled => true,
            Staging => matches!(from, Pending | Submitted | Running),
            Submitted => from == Staging,
            Running => from == Submitted,
            Succeeded => from == Running,
            Failed => matches!(from, Staging | Submitted | Running),
            Pending => false,
        }
    }

    /// Move `record` to `to`, maintaining attempt count, history and
    /// timestamps.
    ///
    /// - `Pending -> Staging` opens attempt 1.
    /// - `Submitted | Running -> Staging` is the retry edge: it requires
    ///   attempts to remain and increments `attempt_count`.
    /// - `-> Submitted` stamps `submitted_at`; terminal states stamp
    ///   `finished_at`.
    pub fn apply(record: &mut JobRecord, to: JobState) -> Result<Transition, TransitionError> {
        let from = record.state;
        if !Self::is_legal(from, to) {
            return Err(TransitionError::Illegal { from, to });
        }

        let retry = to == JobState::Staging && from != JobState::Pending;
        if retry && !record.attempts_remaining() {
            return Err(TransitionError::AttemptsExhausted {
                used: record.attempt_count,
                max: record.max_attempts,
            });
        }

        record.history.push(from);
        record.state = to;

        let transition = match to {
            JobState::Staging if retry => {
                record.attempt_count += 1;
                record.backend_job_id = None;
                Transition::Retry {
                    attempt: record.attempt_count,
                }
            }
            JobState::Staging => {
                record.attempt_count = 1;
                Transition::Next(to)
            }
            JobState::Submitted => {
                record.submitted_at = Some(Utc::now());
                Transition::Next(to)
            }
            s if s.is_terminal() => {
                record.finished_at = Some(Utc::now());
                Transition::Complete(s)
            }
            s => Transition::Next(s),
        };

        Ok(transition)
    }

    /// Whether `history` followed by `current` walks only legal edges.
    pub fn is_valid_path(history: &[JobState], current: JobState) -> bool {
        let mut states = history.iter().copied().chain(std::iter::once(current));
        let Some(mut prev) = states.next() else {
            return true;
        };
        if prev != JobState::Pending {
            return false;
        }
        for next in states {
            if !Self::is_legal(prev, next) {
                return false;
            }
            prev = next;
        }
        true
    }
}
