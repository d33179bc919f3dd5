//! The per-job task that drives a record to a terminal state.
//!
//! One driver owns each job. Every transition of that job happens here, in
//! order, so no two transitions of one job ever overlap.
//!
//! Suspension points and what can interrupt them:
//!
//! | Await | Cancel | Deadline |
//! |-------|--------|----------|
//! | backend/storage call (bounded by `call_timeout`) | yes | yes |
//! | backoff sleep | yes | yes |
//! | poll tick | yes | yes |
//! | backend cancel on the way out (bounded by `call_timeout`) | no | no |
//!
//! Cancellation is also checked between steps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use super::entry::JobEntry;
use super::Shared;
use crate::backend::{submission_name, BackendError, BackendJobId, BackendStatus, PollReport, SubmitRequest};
use crate::state_machine::{FailureKind, JobState, TransitionError};
use crate::storage::{keys, StorageResult};

/// Why the driver stopped before the job finished on its own.
#[derive(Debug)]
enum Stop {
    Cancelled,
    Deadline,
    Illegal(TransitionError),
}

impl From<TransitionError> for Stop {
    fn from(e: TransitionError) -> Self {
        Stop::Illegal(e)
    }
}

/// How the compute side of the job ended.
#[derive(Debug)]
enum Outcome {
    BackendSucceeded,
    Failed(FailureKind),
}

enum Tick {
    Elapsed,
    Callback(PollReport),
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    entry: Arc<JobEntry>,
    callbacks: mpsc::Receiver<PollReport>,
    deadline: Instant,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, entry: Arc<JobEntry>, callbacks: mpsc::Receiver<PollReport>) -> Self {
        let deadline = Instant::now() + shared.config.job_timeout();
        Self {
            shared,
            entry,
            callbacks,
            deadline,
        }
    }

    pub(crate) async fn run(mut self) {
        let result = self.drive().await;
        self.finish(result).await;
    }

    async fn drive(&mut self) -> Result<Outcome, Stop> {
        self.checkpoint()?;
        self.entry.transition(JobState::Staging)?;

        loop {
            if let Err(kind) = self.stage().await? {
                return Ok(Outcome::Failed(kind));
            }
            self.checkpoint()?;

            let backend_id = match self.submit().await? {
                Ok(id) => id,
                Err(kind) => return Ok(Outcome::Failed(kind)),
            };
            self.entry.update(|r| r.backend_job_id = Some(backend_id.0.clone()));
            self.entry.transition(JobState::Submitted)?;

            let kind = match self.watch(&backend_id).await? {
                Outcome::BackendSucceeded => return Ok(Outcome::BackendSucceeded),
                Outcome::Failed(kind) => kind,
            };
            self.entry.record_error(kind.clone());

            let record = self.entry.snapshot();
            if !kind.is_retryable() || !record.attempts_remaining() {
                return Ok(Outcome::Failed(kind));
            }

            let delay = self.shared.config.retry().delay_for_attempt(record.attempt_count);
            tracing::warn!(
                attempt = record.attempt_count,
                max_attempts = record.max_attempts,
                error = %kind,
                delay_ms = delay,
                "Attempt failed, retrying"
            );
            self.backoff(Duration::from_millis(delay)).await?;
            self.entry.transition(JobState::Staging)?;
        }
    }

    /// Clear what earlier attempts or runs left behind, copy the input into
    /// the job's input prefix and write the manifest.
    async fn stage(&mut self) -> Result<Result<(), FailureKind>, Stop> {
        let spec = self.entry.snapshot().spec;
        let store = Arc::clone(&self.shared.store);
        let src = spec.input_key().to_string();
        let dst = keys::staged_input_key(&spec);

        // The marker goes first so no reader sees it next to a half-cleared output.
        for (step, prefix) in [
            ("clear completion marker", keys::done_marker(spec.job_id())),
            ("clear previous output", keys::output_prefix(spec.job_id())),
        ] {
            let cleared = self
                .storage_step(step, || {
                    let store = Arc::clone(&store);
                    let prefix = prefix.clone();
                    async move { store.delete_prefix(&prefix).await }
                })
                .await?;
            if let Err(kind) = cleared {
                return Ok(Err(kind));
            }
        }

        let copied = self
            .storage_step("stage input", || {
                let store = Arc::clone(&store);
                let (src, dst) = (src.clone(), dst.clone());
                async move { store.sync(&src, &dst).await }
            })
            .await?;
        if let Err(kind) = copied {
            return Ok(Err(kind));
        }

        let manifest = keys::JobManifest {
            created_at: self.entry.snapshot().created_at,
            spec: spec.clone(),
        };
        let body = match serde_json::to_vec_pretty(&manifest) {
            Ok(body) => body,
            Err(e) => return Ok(Err(FailureKind::TransientStorage(format!("encode manifest: {e}")))),
        };
        let key = keys::manifest_key(spec.job_id());
        self.storage_step("write manifest", || {
            let store = Arc::clone(&store);
            let (key, body) = (key.clone(), body.clone());
            async move { store.put(&key, body).await }
        })
        .await
    }

    /// Submit the current attempt, confirming ambiguous failures with
    /// `find` before submitting again.
    async fn submit(&mut self) -> Result<Result<BackendJobId, FailureKind>, Stop> {
        let record = self.entry.snapshot();
        let request = SubmitRequest::for_attempt(&record.spec, record.attempt_count, &self.shared.image_tag);
        let backend = Arc::clone(&self.shared.backend);
        let max = self.shared.config.retry().max_attempts;
        let mut unconfirmed = false;
        let mut tries = 0;

        loop {
            tries += 1;
            let error = if unconfirmed {
                match self.call(backend.find(&request.name)).await? {
                    Some(Ok(Some(id))) => {
                        tracing::info!(name = %request.name, backend_job_id = %id, "Recovered earlier submission");
                        return Ok(Ok(id));
                    }
                    Some(Ok(None)) => {
                        unconfirmed = false;
                        tries -= 1;
                        continue;
                    }
                    Some(Err(e)) => format!("confirming submission: {e}"),
                    None => "confirming submission: call timed out".to_string(),
                }
            } else {
                match self.call(backend.submit(&request)).await? {
                    Some(Ok(id)) => {
                        tracing::info!(
                            name = %request.name,
                            backend = backend.name(),
                            backend_job_id = %id,
                            "Submitted to backend"
                        );
                        return Ok(Ok(id));
                    }
                    Some(Err(e)) if !e.is_transient() => {
                        return Ok(Err(FailureKind::BackendFailed(e.to_string())));
                    }
                    Some(Err(e)) => {
                        unconfirmed = true;
                        format!("submit: {e}")
                    }
                    None => {
                        unconfirmed = true;
                        "submit: call timed out".to_string()
                    }
                }
            };

            let kind = FailureKind::TransientBackend(error);
            self.entry.record_error(kind.clone());
            if tries >= max {
                if unconfirmed {
                    // The last submission may still have been accepted.
                    self.cancel_backend().await;
                }
                return Ok(Err(kind));
            }
            let delay = self.shared.config.retry().delay_for_attempt(tries);
            tracing::warn!(tries, error = %kind, delay_ms = delay, "Submission failed");
            self.backoff(Duration::from_millis(delay)).await?;
        }
    }

    /// Poll until the backend reports a final status for this attempt.
    async fn watch(&mut self, id: &BackendJobId) -> Result<Outcome, Stop> {
        let backend = Arc::clone(&self.shared.backend);
        let max_failures = self.shared.config.retry().max_attempts;
        let mut poll_failures = 0;

        loop {
            let report = match self.tick().await? {
                Tick::Callback(report) => report,
                Tick::Elapsed => {
                    let polled = match self.call(backend.poll(id)).await? {
                        Some(Ok(report)) => {
                            poll_failures = 0;
                            Some(report)
                        }
                        Some(Err(BackendError::UnknownJob(_))) => {
                            self.cancel_backend().await;
                            return Ok(Outcome::Failed(FailureKind::TransientBackend(format!(
                                "backend lost job {id}"
                            ))));
                        }
                        Some(Err(e)) => {
                            poll_failures += 1;
                            self.entry
                                .record_error(FailureKind::TransientBackend(format!("poll: {e}")));
                            None
                        }
                        None => {
                            poll_failures += 1;
                            self.entry
                                .record_error(FailureKind::TransientBackend("poll: call timed out".into()));
                            None
                        }
                    };
                    match polled {
                        Some(report) => report,
                        None if poll_failures >= max_failures => {
                            // The attempt may still be running out of sight.
                            self.cancel_backend().await;
                            return Ok(Outcome::Failed(FailureKind::TransientBackend(format!(
                                "{poll_failures} consecutive poll failures"
                            ))));
                        }
                        None => continue,
                    }
                }
            };

            tracing::debug!(status = ?report.status, detail = ?report.detail, "Backend status");
            let detail = report.detail.unwrap_or_default();
            match report.status {
                BackendStatus::Queued => {}
                BackendStatus::Running => self.ensure_running()?,
                BackendStatus::Succeeded => {
                    self.ensure_running()?;
                    return Ok(Outcome::BackendSucceeded);
                }
                BackendStatus::Failed { retryable: true } => {
                    return Ok(Outcome::Failed(FailureKind::TransientBackend(detail)));
                }
                BackendStatus::Failed { retryable: false } => {
                    return Ok(Outcome::Failed(FailureKind::BackendFailed(detail)));
                }
            }
        }
    }

    /// Verify output exists, then write the completion marker.
    async fn complete(&mut self) -> Result<Result<(), FailureKind>, Stop> {
        let job_id = self.entry.snapshot().spec.job_id().clone();
        let store = Arc::clone(&self.shared.store);
        let output = keys::output_prefix(&job_id);
        let marker = keys::done_marker(&job_id);

        let has_output = self
            .storage_step("check output", || {
                let store = Arc::clone(&store);
                let output = output.clone();
                async move { store.exists_nonempty(&output).await }
            })
            .await?;
        match has_output {
            Err(kind) => return Ok(Err(kind)),
            Ok(false) => {
                return Ok(Err(FailureKind::EmptyOutput(format!("nothing under {output}"))));
            }
            Ok(true) => {}
        }

        self.storage_step("write completion marker", || {
            let store = Arc::clone(&store);
            let marker = marker.clone();
            async move { store.put_marker(&marker).await }
        })
        .await
    }

    async fn finish(&mut self, result: Result<Outcome, Stop>) {
        if !self.entry.claim_terminal() {
            tracing::debug!("Job already terminal");
            return;
        }

        let (state, error) = match result {
            Ok(Outcome::BackendSucceeded) => match self.complete().await {
                Ok(Ok(())) => (JobState::Succeeded, None),
                Ok(Err(kind)) => (JobState::Failed, Some(kind)),
                Err(stop) => self.stopped(stop).await,
            },
            Ok(Outcome::Failed(kind)) => (JobState::Failed, Some(kind)),
            Err(stop) => self.stopped(stop).await,
        };

        if let Some(error) = &error {
            self.entry.record_error(error.clone());
        }
        match self.entry.transition(state) {
            Ok(_) if state == JobState::Succeeded => tracing::info!("Job succeeded"),
            Ok(_) => tracing::warn!(%state, error = ?error.map(|e| e.to_string()), "Job finished unsuccessfully"),
            Err(e) => tracing::error!(error = %e, "Could not record terminal state"),
        }
    }

    async fn stopped(&mut self, stop: Stop) -> (JobState, Option<FailureKind>) {
        match stop {
            Stop::Cancelled => {
                self.cancel_backend().await;
                (JobState::Cancelled, Some(FailureKind::Cancelled))
            }
            Stop::Deadline => {
                self.cancel_backend().await;
                let limit = self.shared.config.job_timeout();
                (
                    JobState::TimedOut,
                    Some(FailureKind::Timeout(format!("deadline of {limit:?} exceeded"))),
                )
            }
            Stop::Illegal(e) => {
                tracing::error!(error = %e, "Illegal state transition");
                self.cancel_backend().await;
                (JobState::Failed, Some(FailureKind::BackendFailed(e.to_string())))
            }
        }
    }

    /// Best-effort cancellation of the current attempt on the backend.
    async fn cancel_backend(&mut self) {
        let record = self.entry.snapshot();
        let backend = Arc::clone(&self.shared.backend);
        let call_timeout = self.shared.config.call_timeout();

        let id = match record.backend_job_id {
            Some(id) => Some(BackendJobId(id)),
            // A submission may have been in flight when we stopped.
            None if record.attempt_count > 0 => {
                let name = submission_name(record.job_id(), record.attempt_count);
                match timeout(call_timeout, backend.find(&name)).await {
                    Ok(Ok(found)) => found,
                    _ => None,
                }
            }
            None => None,
        };
        let Some(id) = id else {
            return;
        };

        match timeout(call_timeout, backend.cancel(&id)).await {
            Ok(Ok(())) => tracing::info!(backend_job_id = %id, "Cancelled backend job"),
            Ok(Err(e)) => tracing::warn!(backend_job_id = %id, error = %e, "Backend cancel failed"),
            Err(_) => tracing::warn!(backend_job_id = %id, "Backend cancel timed out"),
        }
    }

    /// Retry a storage operation with exponential backoff. Every failure is
    /// recorded as the job's `last_error`.
    async fn storage_step<T, F, Fut>(&mut self, step: &'static str, mut op: F) -> Result<Result<T, FailureKind>, Stop>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let retry = self.shared.config.retry();
        let mut tries = 0;
        loop {
            tries += 1;
            let error = match self.call(op()).await? {
                Some(Ok(value)) => return Ok(Ok(value)),
                Some(Err(e)) => e.to_string(),
                None => "call timed out".to_string(),
            };
            let kind = FailureKind::TransientStorage(format!("{step}: {error}"));
            self.entry.record_error(kind.clone());
            if tries >= retry.max_attempts {
                return Ok(Err(kind));
            }
            let delay = retry.delay_for_attempt(tries);
            tracing::warn!(step, tries, error = %kind, delay_ms = delay, "Storage step failed");
            self.backoff(Duration::from_millis(delay)).await?;
        }
    }

    fn ensure_running(&self) -> Result<(), Stop> {
        if self.entry.state() == JobState::Submitted {
            self.entry.transition(JobState::Running)?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), Stop> {
        if self.entry.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Stop::Deadline);
        }
        Ok(())
    }

    /// Run one backend or storage call. `None` when it exceeded
    /// `call_timeout`. Cancellation and the deadline abandon the call.
    async fn call<T>(&self, fut: impl Future<Output = T>) -> Result<Option<T>, Stop> {
        let call_timeout = self.shared.config.call_timeout();
        tokio::select! {
            biased;
            _ = self.entry.cancel.cancelled() => Err(Stop::Cancelled),
            _ = sleep_until(self.deadline) => Err(Stop::Deadline),
            result = timeout(call_timeout, fut) => Ok(result.ok()),
        }
    }

    async fn backoff(&self, delay: Duration) -> Result<(), Stop> {
        tokio::select! {
            biased;
            _ = self.entry.cancel.cancelled() => Err(Stop::Cancelled),
            _ = sleep_until(self.deadline) => Err(Stop::Deadline),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Wait one jittered poll interval, returning early for a pushed status.
    async fn tick(&mut self) -> Result<Tick, Stop> {
        let interval = self.shared.config.jittered_poll_interval();
        tokio::select! {
            biased;
            _ = self.entry.cancel.cancelled() => Err(Stop::Cancelled),
            _ = sleep_until(self.deadline) => Err(Stop::Deadline),
            Some(report) = self.callbacks.recv() => Ok(Tick::Callback(report)),
            _ = sleep(interval) => Ok(Tick::Elapsed),
        }
    }
}
