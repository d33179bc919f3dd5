use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

const IMAGE_NAME: &str = "ghcr.io/batchscribe/whisper";
const MAX_JOB_ID_LEN: usize = 128;

/// Opaque job identifier. Also used as the job's storage prefix, so it is
/// restricted to `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if s.is_empty() {
            return Err("job id must not be empty".into());
        }
        if s.len() > MAX_JOB_ID_LEN {
            return Err(format!("job id longer than {MAX_JOB_ID_LEN} characters"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("job id {s:?} contains characters outside [A-Za-z0-9_-]"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Supported transcription model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    /// Name of the model weights the container loads.
    pub fn model_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large-v3",
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ModelSize::ALL
            .into_iter()
            .find(|m| m.to_string() == lower || m.model_name() == lower)
            .ok_or_else(|| format!("unsupported model {s:?}"))
    }
}

/// ISO 639 language code, or `auto` to let the model detect it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    pub fn auto() -> Self {
        Self("auto".into())
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "auto" {
            return Ok(Self::auto());
        }
        let valid = (2..=3).contains(&lower.len()) && lower.chars().all(|c| c.is_ascii_lowercase());
        if valid {
            Ok(Self(lower))
        } else {
            Err(format!("{s:?} is not an ISO 639 language code or \"auto\""))
        }
    }

    pub fn is_auto(&self) -> bool {
        self.0 == "auto"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One transcription request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    job_id: JobId,
    input_key: String,
    model: ModelSize,
    language: Language,
}

impl JobSpec {
    pub fn new(job_id: JobId, input_key: impl Into<String>, model: ModelSize, language: Language) -> Self {
        Self {
            job_id,
            input_key: input_key.into(),
            model,
            language,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn input_key(&self) -> &str {
        &self.input_key
    }

    pub fn model(&self) -> ModelSize {
        self.model
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    /// Last path segment of the input key, used as the staged file name.
    pub fn input_file_name(&self) -> &str {
        let trimmed = self.input_key.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    /// Container image reference for this job's model.
    pub fn image(&self, tag: &str) -> String {
        format!("{IMAGE_NAME}:{}-{tag}", self.model.model_name())
    }

    /// Environment handed to the transcription container.
    pub fn container_env(&self) -> Vec<(String, String)> {
        vec![
            ("TRK_JOB_UID".into(), self.job_id.to_string()),
            ("TRK_INPUT_FILE".into(), self.input_file_name().to_string()),
            ("TRK_LANGUAGE".into(), self.language.to_string()),
            ("TRK_MODEL".into(), self.model.model_name().to_string()),
        ]
    }
}

/// Why a job attempt or a whole job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum FailureKind {
    /// The artifact store refused or dropped a call.
    TransientStorage(String),
    /// The compute backend refused or dropped a call, or reported a retryable failure.
    TransientBackend(String),
    /// The backend reported a failure that retrying will not fix.
    BackendFailed(String),
    /// The compute job finished but left nothing under the output prefix.
    EmptyOutput(String),
    /// The per-job deadline elapsed.
    Timeout(String),
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientStorage(_) | FailureKind::TransientBackend(_)
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TransientStorage(msg) => write!(f, "Transient storage failure: {msg}"),
            FailureKind::TransientBackend(msg) => write!(f, "Transient backend failure: {msg}"),
            FailureKind::BackendFailed(msg) => write!(f, "Backend failure: {msg}"),
            FailureKind::EmptyOutput(msg) => write!(f, "Empty output: {msg}"),
            FailureKind::Timeout(msg) => write!(f, "Timed out: {msg}"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Upper bound on compute attempts, and on retries of a single staging or
    /// submission step.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Ceiling for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Tracker-owned lifecycle record of one job. Callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    /// 1-based number of the current compute attempt; 0 until staging begins.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Identifier the backend assigned to the current attempt.
    pub backend_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<FailureKind>,
    /// States left behind, oldest first.
    pub history: Vec<JobState>,
}

impl JobRecord {
    pub fn new(spec: JobSpec, max_attempts: u32) -> Self {
        Self {
            spec,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts,
            backend_job_id: None,
            created_at: Utc::now(),
            submitted_at: None,
            finished_at: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.spec.job_id()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}
