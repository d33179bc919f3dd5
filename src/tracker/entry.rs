//! Per-job slot in the tracker's job map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::PollReport;
use crate::state_machine::{FailureKind, JobRecord, JobState, StateMachine, Transition, TransitionError};

const CALLBACK_BUFFER: usize = 16;

/// Shared state of one tracked job.
///
/// Only the job's driver task changes `record`; everyone else reads
/// snapshots.
pub(crate) struct JobEntry {
    record: Mutex<JobRecord>,
    /// Set once terminal side effects have been claimed.
    terminal: AtomicBool,
    finished_at: Mutex<Option<Instant>>,
    pub(crate) cancel: CancellationToken,
    callbacks: mpsc::Sender<PollReport>,
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    pub(crate) fn new(record: JobRecord) -> (Self, mpsc::Receiver<PollReport>) {
        let (callbacks, rx) = mpsc::channel(CALLBACK_BUFFER);
        let (state_tx, _) = watch::channel(record.state);
        let entry = Self {
            record: Mutex::new(record),
            terminal: AtomicBool::new(false),
            finished_at: Mutex::new(None),
            cancel: CancellationToken::new(),
            callbacks,
            state_tx,
        };
        (entry, rx)
    }

    fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> JobRecord {
        self.lock().clone()
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Apply a state change and publish it to subscribers.
    pub(crate) fn transition(&self, to: JobState) -> Result<Transition, TransitionError> {
        let (from, transition, attempt) = {
            let mut record = self.lock();
            let from = record.state;
            let transition = StateMachine::apply(&mut record, to)?;
            (from, transition, record.attempt_count)
        };
        tracing::info!(%from, %to, attempt, "Job state changed");
        if to.is_terminal() {
            *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        }
        self.state_tx.send_replace(to);
        Ok(transition)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut JobRecord)) {
        f(&mut self.lock());
    }

    pub(crate) fn record_error(&self, error: FailureKind) {
        self.update(|r| r.last_error = Some(error));
    }

    /// Claim the right to run terminal side effects. Returns `false` if
    /// another path already claimed it.
    pub(crate) fn claim_terminal(&self) -> bool {
        self.terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Terminal and past `retention` at `now`.
    pub(crate) fn expired(&self, now: Instant, retention: std::time::Duration) -> bool {
        self.finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }

    /// Hand a backend-reported status to the driver. Dropped when the job is
    /// terminal or the buffer is full; polling picks up the same status.
    pub(crate) fn deliver(&self, report: PollReport) -> bool {
        if self.is_claimed() {
            return false;
        }
        self.callbacks.try_send(report).is_ok()
    }
}
