//! Job records, status state machine, and ledger helpers.
//!
//! A run's ledger (`jobs.json`) is an ordered list of [`JobRecord`]s. Records
//! are created `pending` by [`expand_configs_to_jobs`] and afterwards only
//! mutated through [`update_job_status`], which is the single place where
//! transition rules and timestamp side effects are enforced.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{now, Timestamp};

/// Schema version written into every new job record.
pub const JOB_VERSION: u32 = 1;

/// Width of the zero-padded sequence segment inside a job id.
const SEQUENCE_WIDTH: usize = 4;

/// Number of random hex characters appended to a job id.
const SUFFIX_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Older ledgers spell this state `in-progress`.
    #[serde(alias = "in-progress")]
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Wire name, as written to `jobs.json` and `manifest.csv`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the set of statuses reachable from `self`.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub run_id: String,
    pub sequence: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub worker: Option<String>,
    /// Opaque render configuration. Never interpreted by the scheduler.
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_version() -> u32 {
    JOB_VERSION
}

impl JobRecord {
    /// Stable scan order within a run: `(sequence, job_id)`.
    pub fn sort_key(&self) -> (u32, &str) {
        (self.sequence, self.job_id.as_str())
    }
}

/// Build a job id of the form `<run_id>-<sequence:04>-<8 hex chars>`.
pub fn make_job_id(run_id: &str, sequence: u32) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{run_id}-{sequence:0width$}-{}",
        &suffix[..SUFFIX_LEN],
        width = SEQUENCE_WIDTH
    )
}

/// Create a fresh pending record for `config` at position `sequence`.
///
/// A string `"note"` field inside the config becomes the record's notes.
pub fn create_job_record(run_id: &str, sequence: u32, config: serde_json::Value) -> JobRecord {
    let created = now();
    let notes = config
        .get("note")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    JobRecord {
        job_id: make_job_id(run_id, sequence),
        run_id: run_id.to_string(),
        sequence,
        status: JobStatus::Pending,
        worker: None,
        config,
        created_at: created,
        updated_at: created,
        started_at: None,
        finished_at: None,
        result: None,
        version: JOB_VERSION,
        notes,
    }
}

/// Expand render configurations into pending job records, numbered `1..=N`
/// in input order.
pub fn expand_configs_to_jobs<I>(run_id: &str, configs: I) -> Vec<JobRecord>
where
    I: IntoIterator<Item = serde_json::Value>,
{
    configs
        .into_iter()
        .zip(1u32..)
        .map(|(config, sequence)| create_job_record(run_id, sequence, config))
        .collect()
}

/// Apply a status transition to `job`.
///
/// - `pending -> running` requires a `worker`; sets `started_at` once.
/// - `running -> completed | failed` sets `finished_at` and, if given,
///   `result`. The owning worker is kept; a different `worker` is rejected.
///
/// Any other transition returns [`CoreError::InvalidTransition`] and leaves
/// the record untouched.
pub fn update_job_status(
    job: &mut JobRecord,
    status: JobStatus,
    worker: Option<&str>,
    result: Option<serde_json::Value>,
) -> Result<(), CoreError> {
    if !job.status.can_transition_to(status) {
        return Err(CoreError::InvalidTransition {
            from: job.status,
            to: status,
        });
    }

    let stamp = now();
    match status {
        JobStatus::Running => {
            let worker = worker.ok_or_else(|| {
                CoreError::Validation(format!("Job {} cannot start without a worker", job.job_id))
            })?;
            job.worker = Some(worker.to_string());
            if job.started_at.is_none() {
                job.started_at = Some(stamp);
            }
        }
        JobStatus::Completed | JobStatus::Failed => {
            if let (Some(owner), Some(reporter)) = (job.worker.as_deref(), worker) {
                if owner != reporter {
                    return Err(CoreError::Validation(format!(
                        "Job {} is owned by {owner}, not {reporter}",
                        job.job_id
                    )));
                }
            }
            if job.worker.is_none() {
                job.worker = worker.map(str::to_string);
            }
            job.finished_at = Some(stamp);
            if result.is_some() {
                job.result = result;
            }
        }
        // No transition leads back to pending; rejected above.
        JobStatus::Pending => {}
    }

    job.status = status;
    job.updated_at = stamp;
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger helpers
// ---------------------------------------------------------------------------

/// Return the first `pending` job in `(sequence, job_id)` order.
pub fn first_pending(jobs: &[JobRecord]) -> Option<&JobRecord> {
    jobs.iter()
        .filter(|job| job.status == JobStatus::Pending)
        .min_by(|a, b| a.sort_key().cmp(&b.sort_key()))
}

/// Pending job ids in scan order.
pub fn pending_in_scan_order(jobs: &[JobRecord]) -> Vec<String> {
    let mut pending: Vec<&JobRecord> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Pending)
        .collect();
    pending.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    pending.into_iter().map(|job| job.job_id.clone()).collect()
}

pub fn find_job<'a>(jobs: &'a [JobRecord], job_id: &str) -> Option<&'a JobRecord> {
    jobs.iter().find(|job| job.job_id == job_id)
}

pub fn find_job_mut<'a>(jobs: &'a mut [JobRecord], job_id: &str) -> Option<&'a mut JobRecord> {
    jobs.iter_mut().find(|job| job.job_id == job_id)
}

/// Check ledger-wide invariants: unique sequences, unique job ids, and every
/// record belonging to `run_id`.
pub fn validate_ledger(run_id: &str, jobs: &[JobRecord]) -> Result<(), CoreError> {
    let mut sequences = HashSet::with_capacity(jobs.len());
    let mut ids = HashSet::with_capacity(jobs.len());

    for job in jobs {
        if job.run_id != run_id {
            return Err(CoreError::Validation(format!(
                "Job {} belongs to run {}, not {run_id}",
                job.job_id, job.run_id
            )));
        }
        if !sequences.insert(job.sequence) {
            return Err(CoreError::Validation(format!(
                "Duplicate sequence {} in run {run_id}",
                job.sequence
            )));
        }
        if !ids.insert(job.job_id.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate job id {} in run {run_id}",
                job.job_id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
