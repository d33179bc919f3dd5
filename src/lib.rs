//! Dispatch and lifecycle tracking for batch transcription jobs.
//!
//! A [`Dispatcher`] validates requests and hands them to the [`JobTracker`],
//! which stages input through an [`ArtifactStore`], submits work to a
//! [`ComputeBackend`], polls it to completion and records the outcome on the
//! job's [`JobRecord`].

pub mod backend;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod state_machine;
pub mod storage;
pub mod tracker;
pub mod ui;

pub use backend::ComputeBackend;
pub use dispatcher::{Dispatcher, JobRequest};
pub use error::DispatchError;
pub use state_machine::{JobRecord, JobState};
pub use storage::ArtifactStore;
pub use tracker::JobTracker;
