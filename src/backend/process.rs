//! Compute backend that runs each job as a local child process.
//!
//! The configured command is started once per attempt with the container
//! environment plus two extra variables:
//! - `TRK_INPUT_DIR`: directory holding the staged input
//! - `TRK_OUTPUT_DIR`: directory the command must write its output to
//!
//! Both point into a [`LocalFsStore`], so whatever the command writes to
//! `TRK_OUTPUT_DIR` is immediately visible under the job's output prefix.
//! Combined stdout/stderr goes to `{job_id}/logs/{name}.log`.
//!
//! A child is dropped from the live table as soon as a poll sees it exit.
//! Only its exit status is kept, in a bounded history of recent exits.

use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::error::{BackendError, BackendResult};
use super::{BackendJobId, BackendStatus, ComputeBackend, PollReport, SubmitRequest};
use crate::storage::{keys, LocalFsStore};

/// Exits remembered after their process left the live table.
const EXIT_HISTORY: usize = 256;

struct Process {
    name: String,
    child: Child,
}

struct Exited {
    id: BackendJobId,
    name: String,
    exit: ExitStatus,
}

#[derive(Default)]
struct Table {
    live: HashMap<BackendJobId, Process>,
    exited: VecDeque<Exited>,
}

impl Table {
    fn exited(&self, id: &BackendJobId) -> Option<&Exited> {
        self.exited.iter().find(|e| &e.id == id)
    }
}

pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    store: LocalFsStore,
    exit_history: usize,
    processes: Mutex<Table>,
}

impl ProcessBackend {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], store: LocalFsStore) -> BackendResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BackendError::Rejected("empty backend command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            store,
            exit_history: EXIT_HISTORY,
            processes: Mutex::new(Table::default()),
        })
    }

    /// Remember at most `len` exited processes.
    pub fn with_exit_history(mut self, len: usize) -> Self {
        self.exit_history = len;
        self
    }

    /// Processes started and not yet seen to exit.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, key: &str) -> BackendResult<std::path::PathBuf> {
        self.store
            .path_for(key)
            .map_err(|e| BackendError::Rejected(e.to_string()))
    }

    fn report(exit: ExitStatus) -> PollReport {
        if exit.success() {
            return PollReport::new(BackendStatus::Succeeded);
        }
        match exit.code() {
            Some(code) => PollReport::new(BackendStatus::Failed { retryable: true })
                .with_detail(format!("exit code {code}")),
            None => PollReport::new(BackendStatus::Failed { retryable: false })
                .with_detail("terminated by signal"),
        }
    }
}

#[async_trait]
impl ComputeBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn submit(&self, request: &SubmitRequest) -> BackendResult<BackendJobId> {
        let input_dir = self.path(&keys::input_prefix(&request.job_id))?;
        let output_dir = self.path(&request.output_prefix)?;
        let log_path = self.path(&format!("{}/logs/{}.log", request.job_id, request.name))?;
        tokio::fs::create_dir_all(&output_dir).await?;
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        tracing::info!(
            job_id = %request.job_id,
            name = %request.name,
            program = %self.program,
            image = %request.image,
            "Starting job process"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TRK_INPUT_DIR", &input_dir)
            .env("TRK_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Rejected(format!("cannot start {}: {e}", self.program)))?;

        let id = BackendJobId(format!("pid-{}-{}", child.id().unwrap_or(0), request.name));
        self.lock().live.insert(
            id.clone(),
            Process {
                name: request.name.clone(),
                child,
            },
        );
        Ok(id)
    }

    async fn poll(&self, id: &BackendJobId) -> BackendResult<PollReport> {
        let mut table = self.lock();
        let Some(process) = table.live.get_mut(id) else {
            return table
                .exited(id)
                .map(|e| Self::report(e.exit))
                .ok_or_else(|| BackendError::UnknownJob(id.0.clone()));
        };
        let Some(exit) = process.child.try_wait()? else {
            return Ok(PollReport::new(BackendStatus::Running));
        };
        tracing::debug!(backend_job_id = %id, %exit, "Job process exited");
        if let Some(process) = table.live.remove(id) {
            table.exited.push_back(Exited {
                id: id.clone(),
                name: process.name,
                exit,
            });
            while table.exited.len() > self.exit_history {
                table.exited.pop_front();
            }
        }
        Ok(Self::report(exit))
    }

    async fn cancel(&self, id: &BackendJobId) -> BackendResult<()> {
        let mut table = self.lock();
        let Some(process) = table.live.get_mut(id) else {
            return match table.exited(id) {
                Some(_) => Ok(()),
                None => Err(BackendError::UnknownJob(id.0.clone())),
            };
        };
        match process.child.start_kill() {
            Ok(()) => tracing::info!(backend_job_id = %id, "Killed job process"),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn find(&self, name: &str) -> BackendResult<Option<BackendJobId>> {
        let table = self.lock();
        let live = table.live.iter().find(|(_, p)| p.name == name).map(|(id, _)| id);
        let exited = || table.exited.iter().find(|e| e.name == name).map(|e| &e.id);
        Ok(live.or_else(exited).cloned())
    }
}
