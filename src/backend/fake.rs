//! Scripted in-memory compute backend.
//!
//! Poll results come from a script shared by every submitted job; once the
//! script runs out the last entry repeats. Failures, lost submit responses
//! and latency can be injected, and every call is counted so tests can assert
//! on exactly what the tracker asked for.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::error::{BackendError, BackendResult};
use super::{BackendJobId, BackendStatus, ComputeBackend, PollReport, SubmitRequest};
use crate::storage::ArtifactStore;

const OUTPUT_FILE: &str = "transcript.txt";

#[derive(Debug, Default)]
struct Inner {
    script: VecDeque<PollReport>,
    last: Option<PollReport>,
    submitted: Vec<SubmitRequest>,
    jobs: HashMap<BackendJobId, SubmitRequest>,
    cancelled: Vec<BackendJobId>,
    submit_failures: u32,
    poll_failures: u32,
    lost_responses: u32,
    latency: Option<Duration>,
    active: HashMap<String, u32>,
    max_overlap: u32,
}

/// A [`ComputeBackend`] whose behavior is set up front by a test.
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
    next_id: AtomicU32,
    polls: AtomicU32,
    output: Option<(Arc<dyn ArtifactStore>, Vec<u8>)>,
}

impl ScriptedBackend {
    /// Backend answering polls with `script` in order, repeating the last entry.
    pub fn with_script(script: impl IntoIterator<Item = PollReport>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                script: script.into_iter().collect(),
                ..Default::default()
            }),
            next_id: AtomicU32::new(1),
            polls: AtomicU32::new(0),
            output: None,
        }
    }

    /// Reports `Running` for `running_polls` polls, then `Succeeded`.
    pub fn succeeding_after(running_polls: usize) -> Self {
        let mut script = vec![PollReport::new(BackendStatus::Running); running_polls];
        script.push(PollReport::new(BackendStatus::Succeeded));
        Self::with_script(script)
    }

    /// Reports `status` on every poll.
    pub fn always(status: BackendStatus) -> Self {
        Self::with_script([PollReport::new(status)])
    }

    /// Write `content` under the job's output prefix the first time a poll
    /// reports `Succeeded`, standing in for the container's output upload.
    pub fn writing_output(mut self, store: Arc<dyn ArtifactStore>, content: impl Into<Vec<u8>>) -> Self {
        self.output = Some((store, content.into()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` submissions with a transient error.
    pub fn fail_submits(&self, times: u32) {
        self.lock().submit_failures = times;
    }

    /// Fail the next `times` polls of known jobs with a transient error.
    pub fn fail_polls(&self, times: u32) {
        self.lock().poll_failures = times;
    }

    /// Accept the next `times` submissions but answer them with a transient
    /// error, as if the response was lost on the way back.
    pub fn lose_submit_responses(&self, times: u32) {
        self.lock().lost_responses = times;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Every request that reached the backend, accepted or not.
    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.lock().submitted.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.lock().submitted.len()
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<BackendJobId> {
        self.lock().cancelled.clone()
    }

    /// Highest number of calls observed in flight at once for a single job.
    pub fn max_overlap_per_job(&self) -> u32 {
        self.lock().max_overlap
    }

    /// Count a call as in flight until the returned guard drops, which also
    /// covers calls abandoned mid-latency.
    async fn enter(&self, job_key: &str) -> InFlight<'_> {
        let latency = {
            let mut inner = self.lock();
            let active = inner.active.entry(job_key.to_string()).or_insert(0);
            *active += 1;
            let now = *active;
            inner.max_overlap = inner.max_overlap.max(now);
            inner.latency
        };
        let guard = InFlight {
            backend: self,
            job_key: job_key.to_string(),
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn job_key(&self, id: &BackendJobId) -> String {
        self.lock()
            .jobs
            .get(id)
            .map(|r| r.job_id.to_string())
            .unwrap_or_else(|| id.0.clone())
    }

    fn next_report(&self) -> PollReport {
        let mut inner = self.lock();
        match inner.script.pop_front() {
            Some(report) => {
                inner.last = Some(report.clone());
                report
            }
            None => inner
                .last
                .clone()
                .unwrap_or_else(|| PollReport::new(BackendStatus::Running)),
        }
    }
}

struct InFlight<'a> {
    backend: &'a ScriptedBackend,
    job_key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.backend.lock().active.get_mut(&self.job_key) {
            *active = active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ComputeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &SubmitRequest) -> BackendResult<BackendJobId> {
        let key = request.job_id.to_string();
        let _in_flight = self.enter(&key).await;
        let mut inner = self.lock();
        inner.submitted.push(request.clone());
        if inner.submit_failures > 0 {
            inner.submit_failures -= 1;
            return Err(BackendError::Transient("injected submit failure".into()));
        }
        let id = BackendJobId(format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        inner.jobs.insert(id.clone(), request.clone());
        if inner.lost_responses > 0 {
            inner.lost_responses -= 1;
            return Err(BackendError::Transient("submit response lost".into()));
        }
        Ok(id)
    }

    async fn poll(&self, id: &BackendJobId) -> BackendResult<PollReport> {
        let key = self.job_key(id);
        let _in_flight = self.enter(&key).await;
        self.polls.fetch_add(1, Ordering::SeqCst);
        let request = {
            let mut inner = self.lock();
            let Some(request) = inner.jobs.get(id).cloned() else {
                return Err(BackendError::UnknownJob(id.0.clone()));
            };
            if inner.poll_failures > 0 {
                inner.poll_failures -= 1;
                return Err(BackendError::Transient("injected poll failure".into()));
            }
            request
        };
        let report = self.next_report();
        if report.status == BackendStatus::Succeeded
            && let Some((store, content)) = &self.output
        {
            let key = format!("{}{OUTPUT_FILE}", request.output_prefix);
            if let Err(e) = store.put(&key, content.clone()).await {
                tracing::warn!(error = %e, "Scripted backend could not write output");
            }
        }
        Ok(report)
    }

    async fn cancel(&self, id: &BackendJobId) -> BackendResult<()> {
        let key = self.job_key(id);
        let _in_flight = self.enter(&key).await;
        self.lock().cancelled.push(id.clone());
        Ok(())
    }

    async fn find(&self, name: &str) -> BackendResult<Option<BackendJobId>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(id, _)| id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobId, JobSpec, Language, ModelSize};
    use crate::storage::InMemoryStore;

    fn request(attempt: u32) -> SubmitRequest {
        let spec = JobSpec::new(
            JobId::parse("abc").unwrap(),
            "in/audio.mp3",
            ModelSize::Large,
            Language::parse("en").unwrap(),
        );
        SubmitRequest::for_attempt(&spec, attempt, "1")
    }

    #[tokio::test]
    async fn script_repeats_last_entry() {
        let backend = ScriptedBackend::succeeding_after(1);
        let id = backend.submit(&request(1)).await.unwrap();
        assert_eq!(backend.poll(&id).await.unwrap().status, BackendStatus::Running);
        assert_eq!(backend.poll(&id).await.unwrap().status, BackendStatus::Succeeded);
        assert_eq!(backend.poll(&id).await.unwrap().status, BackendStatus::Succeeded);
        assert_eq!(backend.poll_count(), 3);
    }

    #[tokio::test]
    async fn unknown_job_poll_fails() {
        let backend = ScriptedBackend::always(BackendStatus::Running);
        let err = backend.poll(&BackendJobId("nope".into())).await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn lost_response_is_findable() {
        let backend = ScriptedBackend::always(BackendStatus::Running);
        backend.lose_submit_responses(1);
        let err = backend.submit(&request(1)).await.unwrap_err();
        assert!(err.is_transient());
        let found = backend.find("abc-1").await.unwrap();
        assert!(found.is_some());
        assert!(backend.find("abc-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_submit_failure_is_not_findable() {
        let backend = ScriptedBackend::always(BackendStatus::Running);
        backend.fail_submits(1);
        assert!(backend.submit(&request(1)).await.is_err());
        assert!(backend.find("abc-1").await.unwrap().is_none());
        assert!(backend.submit(&request(1)).await.is_ok());
        assert_eq!(backend.submit_count(), 2);
    }

    #[tokio::test]
    async fn injected_poll_failures_run_out() {
        let backend = ScriptedBackend::always(BackendStatus::Running);
        backend.fail_polls(2);
        let id = backend.submit(&request(1)).await.unwrap();
        assert!(backend.poll(&id).await.unwrap_err().is_transient());
        assert!(backend.poll(&id).await.unwrap_err().is_transient());
        assert_eq!(backend.poll(&id).await.unwrap().status, BackendStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_is_no_longer_in_flight() {
        let backend = ScriptedBackend::always(BackendStatus::Running);
        let id = backend.submit(&request(1)).await.unwrap();
        backend.set_latency(Duration::from_secs(5));
        let abandoned = tokio::time::timeout(Duration::from_secs(1), backend.poll(&id)).await;
        assert!(abandoned.is_err());
        backend.cancel(&id).await.unwrap();
        assert_eq!(backend.max_overlap_per_job(), 1);
    }

    #[tokio::test]
    async fn success_writes_output() {
        let store = Arc::new(InMemoryStore::new());
        let backend = ScriptedBackend::succeeding_after(0).writing_output(store.clone(), "hello");
        let id = backend.submit(&request(1)).await.unwrap();
        backend.poll(&id).await.unwrap();
        assert_eq!(store.object("abc/out/transcript.txt").unwrap(), b"hello");
    }
}
