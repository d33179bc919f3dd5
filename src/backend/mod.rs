//! Compute backend client interface.
//!
//! The [`ComputeBackend`] trait covers the lifecycle of one compute job on
//! an elastic batch fleet:
//!
//! ```text
//!   submit() ──→ poll() ... poll() ──→ Succeeded | Failed
//!      │            │
//!      └── find()   └── cancel()
//! ```
//!
//! # Contract
//!
//! - `submit()` is not idempotent. After an ambiguous failure the caller
//!   must consult `find()` with the same submission name before submitting
//!   again.
//! - `poll()` may return stale status; callers tolerate repeats.
//! - `cancel()` on a finished job is not an error.
//! - Clients never retry internally.

pub mod error;
pub mod fake;
pub mod process;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state_machine::{JobId, JobSpec};
use crate::storage::keys;

pub use error::{BackendError, BackendResult};
pub use fake::ScriptedBackend;
pub use process::ProcessBackend;

/// Identifier the backend assigns to a submitted compute job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendJobId(pub String);

impl fmt::Display for BackendJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the backend needs to run one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Unique per job attempt: `{job_id}-{attempt}`.
    pub name: String,
    pub job_id: JobId,
    pub attempt: u32,
    /// Container image reference.
    pub image: String,
    /// Environment variables for the container.
    pub env: Vec<(String, String)>,
    /// Store key of the staged input.
    pub input_key: String,
    /// Store prefix the job writes its output under.
    pub output_prefix: String,
}

impl SubmitRequest {
    pub fn for_attempt(spec: &JobSpec, attempt: u32, image_tag: &str) -> Self {
        let job_id = spec.job_id().clone();
        Self {
            name: submission_name(&job_id, attempt),
            attempt,
            image: spec.image(image_tag),
            env: spec.container_env(),
            input_key: keys::staged_input_key(spec),
            output_prefix: keys::output_prefix(&job_id),
            job_id,
        }
    }
}

pub fn submission_name(job_id: &JobId, attempt: u32) -> String {
    format!("{job_id}-{attempt}")
}

/// Backend-reported state of a compute job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    /// Accepted, waiting for capacity.
    Queued,
    Running,
    Succeeded,
    /// Finished unsuccessfully. `retryable` failures (spot reclaim, host
    /// loss, non-zero exit) may succeed on a fresh attempt.
    Failed { retryable: bool },
}

/// One poll result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub status: BackendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PollReport {
    pub fn new(status: BackendStatus) -> Self {
        Self { status, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Client for an elastic batch-compute system.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Name of this backend, for logs.
    fn name(&self) -> &str;

    /// Submit one attempt. Returns the backend's identifier for it.
    async fn submit(&self, request: &SubmitRequest) -> BackendResult<BackendJobId>;

    /// Current status of a submitted job.
    async fn poll(&self, id: &BackendJobId) -> BackendResult<PollReport>;

    /// Stop a submitted job.
    async fn cancel(&self, id: &BackendJobId) -> BackendResult<()>;

    /// Look up a prior submission by its [`SubmitRequest::name`].
    ///
    /// The default implementation knows nothing; backends that can list
    /// jobs by name should override it.
    async fn find(&self, name: &str) -> BackendResult<Option<BackendJobId>> {
        let _ = name;
        Ok(None)
    }
}
