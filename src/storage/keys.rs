//! Object key layout for a job.
//!
//! ```text
//! {job_id}/job.json        manifest, written while staging
//! {job_id}/in/{file}       staged input
//! {job_id}/out/...         transcription output
//! {job_id}/done            completion marker
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{JobId, JobSpec};

pub const INPUT_DIR: &str = "in/";
pub const OUTPUT_DIR: &str = "out/";
pub const DONE_MARKER: &str = "done";
pub const MANIFEST: &str = "job.json";

pub fn job_prefix(job_id: &JobId) -> String {
    format!("{job_id}/")
}

pub fn input_prefix(job_id: &JobId) -> String {
    format!("{job_id}/{INPUT_DIR}")
}

/// Key the compute job reads its input from.
pub fn staged_input_key(spec: &JobSpec) -> String {
    format!("{}{}", input_prefix(spec.job_id()), spec.input_file_name())
}

pub fn output_prefix(job_id: &JobId) -> String {
    format!("{job_id}/{OUTPUT_DIR}")
}

pub fn done_marker(job_id: &JobId) -> String {
    format!("{job_id}/{DONE_MARKER}")
}

pub fn manifest_key(job_id: &JobId) -> String {
    format!("{job_id}/{MANIFEST}")
}

/// Contents of `{job_id}/job.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobManifest {
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
}

/// What an object under a job prefix is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobObject<'a> {
    Manifest,
    Input(&'a str),
    Output(&'a str),
    Done,
}

/// Split a store key into its job id and role. `None` for keys outside the
/// job layout.
pub fn classify(key: &str) -> Option<(JobId, JobObject<'_>)> {
    let (id, rest) = key.split_once('/')?;
    let job_id = JobId::parse(id).ok()?;
    let object = if rest == MANIFEST {
        JobObject::Manifest
    } else if rest == DONE_MARKER {
        JobObject::Done
    } else if let Some(file) = rest.strip_prefix(INPUT_DIR) {
        JobObject::Input(file)
    } else if let Some(file) = rest.strip_prefix(OUTPUT_DIR) {
        JobObject::Output(file)
    } else {
        return None;
    };
    Some((job_id, object))
}

/// What the store holds for one job, derived from its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListing {
    pub job_id: JobId,
    pub has_manifest: bool,
    pub inputs: usize,
    pub outputs: usize,
    pub done: bool,
}

/// Group store keys by job, in job id order. Keys outside the layout are
/// skipped.
pub fn listings<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<JobListing> {
    let mut jobs: BTreeMap<JobId, JobListing> = BTreeMap::new();
    for key in keys {
        let Some((job_id, object)) = classify(key) else {
            continue;
        };
        let listing = jobs.entry(job_id.clone()).or_insert_with(|| JobListing {
            job_id,
            has_manifest: false,
            inputs: 0,
            outputs: 0,
            done: false,
        });
        match object {
            JobObject::Manifest => listing.has_manifest = true,
            JobObject::Input(_) => listing.inputs += 1,
            JobObject::Output(_) => listing.outputs += 1,
            JobObject::Done => listing.done = true,
        }
    }
    jobs.into_values().collect()
}
