mod job;
mod state;

pub use job::{FailureKind, JobId, JobRecord, JobSpec, Language, ModelSize, RetryConfig};
pub use state::{JobState, StateMachine, Transition, TransitionError};
