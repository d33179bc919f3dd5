use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backend::PollReport;
use crate::error::DispatchError;
use crate::state_machine::{JobId, JobRecord, JobSpec, JobState, Language, ModelSize};
use crate::storage::validate_key;
use crate::tracker::JobTracker;

/// An unvalidated transcription request, as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub input_key: String,
    pub model: String,
    /// Defaults to automatic detection.
    #[serde(default)]
    pub language: Option<String>,
}

impl JobRequest {
    pub fn new(input_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            input_key: input_key.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Turn the request into a [`JobSpec`], rejecting anything that must not
    /// reach the state machine.
    pub fn validate(&self) -> Result<JobSpec, DispatchError> {
        let input_key = self.input_key.trim();
        if input_key.is_empty() {
            return Err(DispatchError::Validation("input_key must not be empty".into()));
        }
        validate_key(input_key).map_err(|e| DispatchError::Validation(e.to_string()))?;

        let model: ModelSize = self.model.parse().map_err(DispatchError::Validation)?;

        let language = match self.language.as_deref().map(str::trim) {
            None | Some("") => Language::auto(),
            Some(code) => Language::parse(code).map_err(DispatchError::Validation)?,
        };

        let job_id = match self.job_id.as_deref().map(str::trim) {
            None | Some("") => JobId::generate(),
            Some(id) => JobId::parse(id).map_err(DispatchError::Validation)?,
        };

        Ok(JobSpec::new(job_id, input_key, model, language))
    }
}

/// Entry point for callers: validates requests and forwards them to the
/// [`JobTracker`].
#[derive(Clone)]
pub struct Dispatcher {
    tracker: JobTracker,
}

impl Dispatcher {
    pub fn new(tracker: JobTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Validate and submit. Returns as soon as the job is accepted.
    #[tracing::instrument(skip_all, fields(input_key = %request.input_key, model = %request.model))]
    pub fn submit(&self, request: &JobRequest) -> Result<JobId, DispatchError> {
        let spec = request.validate().inspect_err(|e| {
            tracing::warn!(error = %e, "Rejected job request");
        })?;
        self.tracker.submit(spec)
    }

    pub fn status(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        self.tracker.status(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        self.tracker.cancel(job_id)
    }

    pub fn list(&self) -> Vec<JobRecord> {
        self.tracker.list()
    }

    /// Forward a backend status callback.
    pub fn notify(&self, job_id: &str, report: PollReport) -> Result<(), DispatchError> {
        self.tracker.notify(job_id, report)
    }

    pub fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<JobState>, DispatchError> {
        self.tracker.subscribe(job_id)
    }

    pub async fn wait(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        self.tracker.wait_terminal(job_id).await
    }

    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::config::TrackerConfig;
    use crate::storage::InMemoryStore;

    fn dispatcher(store: Arc<InMemoryStore>) -> Dispatcher {
        let backend = Arc::new(ScriptedBackend::succeeding_after(1).writing_output(store.clone(), "hello"));
        let config = TrackerConfig {
            poll_interval_ms: 1_000,
            ..Default::default()
        };
        Dispatcher::new(JobTracker::new(config, "1", backend, store))
    }

    #[test]
    fn validate_accepts_complete_request() {
        let spec = JobRequest::new("in/audio.mp3", "large")
            .with_job_id("abc")
            .with_language("en")
            .validate()
            .unwrap();
        assert_eq!(spec.job_id().as_str(), "abc");
        assert_eq!(spec.input_key(), "in/audio.mp3");
        assert_eq!(spec.model(), ModelSize::Large);
        assert_eq!(spec.language().as_str(), "en");
    }

    #[test]
    fn validate_fills_defaults() {
        let spec = JobRequest::new("in/audio.mp3", "tiny").validate().unwrap();
        assert!(spec.language().is_auto());
        assert_eq!(spec.job_id().as_str().len(), 32);
    }

    #[test]
    fn validate_rejects_bad_input() {
        let cases = [
            JobRequest::new("", "large"),
            JobRequest::new("   ", "large"),
            JobRequest::new("/etc/passwd", "large"),
            JobRequest::new("in/../secret", "large"),
            JobRequest::new("in/audio.mp3", "huge"),
            JobRequest::new("in/audio.mp3", "large").with_language("english"),
            JobRequest::new("in/audio.mp3", "large").with_job_id("a/b"),
        ];
        for request in cases {
            let err = request.validate().unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)), "{request:?}: {err}");
        }
    }

    #[test]
    fn request_deserializes_with_optional_fields() {
        let request: JobRequest =
            serde_json::from_str(r#"{"input_key": "in/a.wav", "model": "small"}"#).unwrap();
        assert_eq!(request, JobRequest::new("in/a.wav", "small"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_never_reaches_tracker() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = dispatcher(store.clone());
        let err = dispatcher
            .submit(&JobRequest::new("in/audio.mp3", "huge").with_job_id("abc"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(dispatcher.list().is_empty());
        assert!(matches!(dispatcher.status("abc"), Err(DispatchError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_and_wait() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("in/audio.mp3", "RIFF");
        let dispatcher = dispatcher(store.clone());

        let request = JobRequest::new("in/audio.mp3", "large")
            .with_job_id("abc")
            .with_language("en");
        let id = dispatcher.submit(&request).unwrap();
        assert_eq!(dispatcher.status("abc").unwrap().job_id(), &id);

        let record = dispatcher.wait("abc").await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(store.contains("abc/done"));
        dispatcher.shutdown().await;
    }
}
