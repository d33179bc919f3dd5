//! Job tracker: owns every live [`JobRecord`] and drives it to completion.
//!
//! Each submitted job gets one driver task (see `driver`). The task is the
//! only writer of its record, so transitions of a single job are strictly
//! ordered while different jobs progress fully in parallel. The job map
//! itself is only touched to insert, look up and evict entries.
//!
//! ```text
//!   submit() ─→ [JobEntry] ←─ status() / list() / subscribe()
//!                   │   ↑
//!          spawn driver └─ cancel() / notify()
//! ```

mod driver;
mod entry;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::backend::{ComputeBackend, PollReport};
use crate::config::TrackerConfig;
use crate::error::DispatchError;
use crate::state_machine::{JobId, JobRecord, JobSpec, JobState};
use crate::storage::ArtifactStore;

use driver::Driver;
use entry::JobEntry;

pub(crate) struct Shared {
    config: TrackerConfig,
    image_tag: String,
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn ArtifactStore>,
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Shared {
    fn entry(&self, job_id: &str) -> Result<Arc<JobEntry>, DispatchError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(job_id.to_string()))
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention();
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|id, entry| {
            let expired = entry.expired(now, retention);
            if expired {
                tracing::info!(job_id = %id, "Evicted job");
            }
            !expired
        });
        before - jobs.len()
    }
}

/// Handle to a running job tracker. Clones share the same jobs.
#[derive(Clone)]
pub struct JobTracker {
    shared: Arc<Shared>,
}

impl JobTracker {
    /// Create a tracker and start its eviction sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: TrackerConfig,
        image_tag: impl Into<String>,
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            image_tag: image_tag.into(),
            backend,
            store,
            jobs: RwLock::new(HashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        let sweeper = sweep(Arc::downgrade(&shared), shared.shutdown.clone(), shared.config.sweep_interval());
        shared.tasks.spawn(sweeper);
        Self { shared }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Start tracking `spec` and return immediately.
    ///
    /// A job id may be reused once its previous record is terminal; the old
    /// record is replaced.
    #[tracing::instrument(skip_all, fields(job_id = %spec.job_id()))]
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, DispatchError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let job_id = spec.job_id().clone();
        let (input_key, model) = (spec.input_key().to_string(), spec.model());
        let record = JobRecord::new(spec, self.shared.config.retry().max_attempts);
        let (entry, callbacks) = JobEntry::new(record);
        let entry = Arc::new(entry);

        {
            let mut jobs = self.shared.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = jobs.get(&job_id)
                && !existing.state().is_terminal()
            {
                return Err(DispatchError::DuplicateJob(job_id));
            }
            jobs.insert(job_id.clone(), Arc::clone(&entry));
        }
        tracing::info!(input_key, %model, "Job accepted");

        let driver = Driver::new(Arc::clone(&self.shared), entry, callbacks);
        let span = tracing::info_span!("job", job_id = %job_id);
        self.shared.tasks.spawn(driver.run().instrument(span));
        Ok(job_id)
    }

    /// Snapshot of one job.
    pub fn status(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        Ok(self.shared.entry(job_id)?.snapshot())
    }

    /// Snapshots of every tracked job, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = {
            let jobs = self.shared.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.values().map(|entry| entry.snapshot()).collect()
        };
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id().cmp(b.job_id()))
        });
        records
    }

    /// Request cancellation. A no-op for jobs that are already terminal.
    ///
    /// The driver observes the request at its next poll tick, backoff sleep
    /// or step boundary, cancels the backend job and records `Cancelled`.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        let entry = self.shared.entry(job_id)?;
        if entry.is_claimed() {
            tracing::debug!("Cancel ignored, job already terminal");
            return Ok(());
        }
        entry.cancel.cancel();
        tracing::info!("Cancellation requested");
        Ok(())
    }

    /// Push a backend-reported status for a job, as a backend callback
    /// would. Ignored once the job is terminal.
    #[tracing::instrument(skip(self, report), fields(status = ?report.status))]
    pub fn notify(&self, job_id: &str, report: PollReport) -> Result<(), DispatchError> {
        let entry = self.shared.entry(job_id)?;
        if !entry.deliver(report) {
            tracing::debug!("Status callback dropped");
        }
        Ok(())
    }

    /// Watch a job's state changes.
    pub fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<JobState>, DispatchError> {
        Ok(self.shared.entry(job_id)?.subscribe())
    }

    /// Wait until a job reaches a terminal state and return its final record.
    pub async fn wait_terminal(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        let entry = self.shared.entry(job_id)?;
        let mut states = entry.subscribe();
        // The sender lives in the entry, so this only errors if it is gone.
        let _ = states.wait_for(|state| state.is_terminal()).await;
        Ok(entry.snapshot())
    }

    /// Evict terminal jobs older than the retention window. Returns how many
    /// were removed.
    pub fn evict_expired(&self) -> usize {
        self.shared.evict_expired()
    }

    /// Cancel every live job, stop the sweeper and wait for all tasks to
    /// finish. Later submissions fail with [`DispatchError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let live: Vec<Arc<JobEntry>> = {
            let jobs = self.shared.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.values().filter(|e| !e.is_claimed()).cloned().collect()
        };
        tracing::info!(live = live.len(), "Shutting down job tracker");
        for entry in live {
            entry.cancel.cancel();
        }
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        tracing::info!("Job tracker stopped");
    }
}

/// Periodically evict expired jobs until shutdown.
async fn sweep(shared: Weak<Shared>, shutdown: CancellationToken, interval: std::time::Duration) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(tracker) = shared.upgrade() else {
            return;
        };
        let evicted = tracker.evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "Eviction sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{BackendJobId, BackendStatus, ScriptedBackend};
    use crate::state_machine::{FailureKind, Language, ModelSize, StateMachine};
    use crate::storage::{InMemoryStore, StoreOp};

    fn config() -> TrackerConfig {
        TrackerConfig {
            max_attempts: 3,
            poll_interval_ms: 1_000,
            poll_jitter: 0.2,
            job_timeout_secs: 3_600,
            retention_secs: 600,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            call_timeout_ms: 5_000,
            sweep_interval_secs: 60,
        }
    }

    fn spec(id: &str) -> JobSpec {
        JobSpec::new(
            JobId::parse(id).unwrap(),
            "in/audio.mp3",
            ModelSize::Large,
            Language::parse("en").unwrap(),
        )
    }

    fn store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.insert("in/audio.mp3", "RIFF....");
        store
    }

    fn tracker(config: TrackerConfig, backend: &Arc<ScriptedBackend>, store: &Arc<InMemoryStore>) -> JobTracker {
        JobTracker::new(config, "1", backend.clone(), store.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_writes_marker() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(2).writing_output(store.clone(), "hello"));
        let tracker = tracker(config(), &backend, &store);

        let id = tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal(id.as_str()).await.unwrap();

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.attempt_count, 1);
        assert!(record.finished_at.is_some());
        assert!(store.contains("abc/done"));
        assert!(store.contains("abc/in/audio.mp3"));
        assert!(store.contains("abc/job.json"));
        assert_eq!(
            record.history,
            vec![JobState::Pending, JobState::Staging, JobState::Submitted, JobState::Running]
        );
        assert!(StateMachine::is_valid_path(&record.history, record.state));
        assert_eq!(backend.submitted()[0].name, "abc-1");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_output_fails_without_retry() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(0));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert!(matches!(record.last_error, Some(FailureKind::EmptyOutput(_))));
        assert!(!store.contains("abc/done"));
        assert_eq!(backend.submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Failed { retryable: true }));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.attempt_count, record.max_attempts);
        assert_eq!(backend.submit_count(), 3);
        assert!(matches!(record.last_error, Some(FailureKind::TransientBackend(_))));
        let names: Vec<String> = backend.submitted().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["abc-1", "abc-2", "abc-3"]);
        assert!(StateMachine::is_valid_path(&record.history, record.state));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_backend_failure_is_not_retried() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::with_script([
            PollReport::new(BackendStatus::Failed { retryable: false }).with_detail("bad audio"),
        ]));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error, Some(FailureKind::BackendFailed("bad audio".into())));
        assert_eq!(backend.submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_success_callback_is_idempotent() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(0).writing_output(store.clone(), "hello"));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let first = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(first.state, JobState::Succeeded);
        assert_eq!(store.calls(StoreOp::PutMarker), 1);

        tracker
            .notify("abc", PollReport::new(BackendStatus::Succeeded))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let second = tracker.status("abc").unwrap();
        assert_eq!(second.state, JobState::Succeeded);
        assert_eq!(second.finished_at, first.finished_at);
        assert_eq!(store.calls(StoreOp::PutMarker), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_completes_job_before_next_poll() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states
            .wait_for(|s| matches!(s, JobState::Submitted | JobState::Running))
            .await
            .unwrap();

        store.insert("abc/out/transcript.txt", "hello");
        tracker
            .notify("abc", PollReport::new(BackendStatus::Succeeded))
            .unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(store.contains("abc/done"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_job() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();

        tracker.cancel("abc").unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.last_error, Some(FailureKind::Cancelled));
        assert_eq!(backend.cancelled().len(), 1);

        let (polls, submits) = (backend.poll_count(), backend.submit_count());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.poll_count(), polls);
        assert_eq!(backend.submit_count(), submits);

        // Cancelling a terminal job is a no-op.
        tracker.cancel("abc").unwrap();
        assert_eq!(tracker.status("abc").unwrap().state, JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_observed_within_one_poll_interval() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();

        let requested = Instant::now();
        tracker.cancel("abc").unwrap();
        tracker.wait_terminal("abc").await.unwrap();
        assert!(requested.elapsed() <= tracker.config().poll_interval().mul_f64(1.2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_abandons_slow_backend_call() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();

        // The next poll starts within 1.2s and then hangs for 4s.
        backend.set_latency(Duration::from_secs(4));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        backend.set_latency(Duration::ZERO);

        let requested = Instant::now();
        tracker.cancel("abc").unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert!(requested.elapsed() < tracker.config().poll_interval());
        assert_eq!(backend.cancelled(), vec![BackendJobId("scripted-1".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_attempt_is_cancelled_before_retry() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        backend.fail_polls(3);
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();

        let record = tracker.status("abc").unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.backend_job_id.as_deref(), Some("scripted-2"));
        assert_eq!(backend.cancelled(), vec![BackendJobId("scripted-1".into())]);
        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resubmitted_job_does_not_inherit_previous_output() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();
        store.insert("abc/out/transcript.txt", "first run");
        tracker
            .notify("abc", PollReport::new(BackendStatus::Succeeded))
            .unwrap();
        assert_eq!(tracker.wait_terminal("abc").await.unwrap().state, JobState::Succeeded);
        assert!(store.contains("abc/done"));

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Running).await.unwrap();
        assert!(!store.contains("abc/done"));
        assert!(!store.contains("abc/out/transcript.txt"));

        tracker
            .notify("abc", PollReport::new(BackendStatus::Succeeded))
            .unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(matches!(record.last_error, Some(FailureKind::EmptyOutput(_))));
        assert!(!store.contains("abc/done"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_discards_partial_output() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::with_script([
            PollReport::new(BackendStatus::Failed { retryable: true }).with_detail("worker lost"),
            PollReport::new(BackendStatus::Succeeded),
        ]));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let mut states = tracker.subscribe("abc").unwrap();
        states.wait_for(|s| *s == JobState::Submitted).await.unwrap();
        store.insert("abc/out/partial.txt", "half a transcript");

        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.state, JobState::Failed);
        assert!(matches!(record.last_error, Some(FailureKind::EmptyOutput(_))));
        assert!(!store.contains("abc/out/partial.txt"));
        assert!(!store.contains("abc/done"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_and_cancels_backend() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let config = TrackerConfig {
            job_timeout_secs: 30,
            ..config()
        };
        let tracker = tracker(config, &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::TimedOut);
        assert!(matches!(record.last_error, Some(FailureKind::Timeout(_))));
        assert_eq!(backend.cancelled().len(), 1);
        assert!(!store.contains("abc/done"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_call_in_flight_per_job() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(5).writing_output(store.clone(), "hi"));
        backend.set_latency(Duration::from_millis(700));
        let tracker = tracker(config(), &backend, &store);

        for id in ["a", "b", "c"] {
            tracker.submit(spec(id)).unwrap();
        }
        for _ in 0..10 {
            for id in ["a", "b", "c"] {
                let _ = tracker.notify(id, PollReport::new(BackendStatus::Running));
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        tracker.cancel("b").unwrap();

        for id in ["a", "b", "c"] {
            let record = tracker.wait_terminal(id).await.unwrap();
            assert!(record.is_terminal());
            assert!(StateMachine::is_valid_path(&record.history, record.state), "{id}: {:?}", record.history);
        }
        assert_eq!(backend.max_overlap_per_job(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_live_job_rejected() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let err = tracker.submit(spec("abc")).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateJob(_)));

        tracker.cancel("abc").unwrap();
        tracker.wait_terminal("abc").await.unwrap();
        assert!(tracker.submit(spec("abc")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_jobs_evicted_after_retention() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(0).writing_output(store.clone(), "x"));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(tracker.evict_expired(), 0);
        assert!(tracker.status("abc").is_ok());

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(matches!(tracker.status("abc"), Err(DispatchError::NotFound(_))));
        assert!(tracker.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_submit_response_is_recovered_with_find() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(1).writing_output(store.clone(), "x"));
        backend.lose_submit_responses(1);
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(backend.submit_count(), 1);
        assert_eq!(record.backend_job_id.as_deref(), Some("scripted-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submit_is_resubmitted_after_lookup() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::succeeding_after(0).writing_output(store.clone(), "x"));
        backend.fail_submits(1);
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(backend.submit_count(), 2);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn staging_retries_transient_storage_errors() {
        let store = store();
        store.fail_next(StoreOp::Sync, 2);
        let backend = Arc::new(ScriptedBackend::succeeding_after(0).writing_output(store.clone(), "x"));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(store.calls(StoreOp::Sync), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn staging_gives_up_after_max_attempts() {
        let store = store();
        store.fail_next(StoreOp::Sync, 10);
        let backend = Arc::new(ScriptedBackend::succeeding_after(0));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(matches!(record.last_error, Some(FailureKind::TransientStorage(_))));
        assert_eq!(store.calls(StoreOp::Sync), 3);
        assert_eq!(backend.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_input_fails_staging() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::succeeding_after(0));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("abc")).unwrap();
        let record = tracker.wait_terminal("abc").await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(backend.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_errors() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        assert!(matches!(tracker.status("zzz"), Err(DispatchError::NotFound(_))));
        assert!(matches!(tracker.cancel("zzz"), Err(DispatchError::NotFound(_))));
        assert!(matches!(
            tracker.notify("zzz", PollReport::new(BackendStatus::Running)),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn list_is_ordered_by_creation() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("b")).unwrap();
        tracker.submit(spec("a")).unwrap();
        let ids: Vec<String> = tracker.list().iter().map(|r| r.job_id().to_string()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_drains() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::always(BackendStatus::Running));
        let tracker = tracker(config(), &backend, &store);

        tracker.submit(spec("a")).unwrap();
        tracker.submit(spec("b")).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        tracker.shutdown().await;
        for id in ["a", "b"] {
            assert_eq!(tracker.status(id).unwrap().state, JobState::Cancelled);
        }
        assert!(matches!(tracker.submit(spec("c")), Err(DispatchError::ShuttingDown)));
    }
}
