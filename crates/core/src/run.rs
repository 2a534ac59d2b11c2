//! Run metadata (`run.json`), run-id formatting, and aggregate status.
//!
//! Aggregate fields are never patched on their own: after every job
//! transition the full ledger is re-counted with [`RunCounts::from_jobs`] and
//! applied wholesale via [`RunCounts::apply_to`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::{JobRecord, JobStatus};
use crate::types::Timestamp;

/// Width of a zero-padded run id.
pub const RUN_ID_WIDTH: usize = 4;

// ---------------------------------------------------------------------------
// Run ids
// ---------------------------------------------------------------------------

/// Format a run number as a zero-padded id (`8` -> `"0008"`).
pub fn format_run_id(number: u64) -> String {
    format!("{number:0width$}", width = RUN_ID_WIDTH)
}

/// A run id is a non-empty string of ASCII digits.
pub fn is_run_id(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit())
}

/// Parse the numeric value of a run id.
pub fn parse_run_number(run_id: &str) -> Result<u64, CoreError> {
    if !is_run_id(run_id) {
        return Err(CoreError::Validation(format!(
            "Run id '{run_id}' must contain only digits"
        )));
    }
    run_id
        .parse()
        .map_err(|_| CoreError::Validation(format!("Run id '{run_id}' is out of range")))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Aggregate status of a run, derived from its ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    /// At least one job failed.
    Attention,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Attention => "attention",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Contents of `run.json`.
///
/// Keys this struct does not know about are kept in `other` so that a
/// load/save cycle never drops data written by newer tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub garment: Option<String>,
    #[serde(default)]
    pub fabrics: Vec<String>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub views: Vec<String>,
    #[serde(default)]
    pub total_jobs: usize,
    #[serde(default)]
    pub pending_jobs: usize,
    #[serde(default)]
    pub completed_jobs: usize,
    #[serde(default)]
    pub failed_jobs: usize,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub last_activity: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl RunMetadata {
    /// Minimal metadata for `run_id`, used when `run.json` is missing.
    pub fn empty(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }
}

/// Deduplicate and sort a set-valued descriptive field.
pub fn normalize_set<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = values.into_iter().map(Into::into).collect();
    out.sort();
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Per-status job counts for one ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RunCounts {
    pub fn from_jobs(jobs: &[JobRecord]) -> Self {
        let mut counts = Self {
            total: jobs.len(),
            ..Self::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Pending => {}
            }
        }
        counts
    }

    pub fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.completed + self.failed + self.running)
    }

    /// Derive the aggregate status. When no rule applies the `previous`
    /// status is kept.
    pub fn aggregate_status(&self, previous: RunStatus) -> RunStatus {
        if self.total > 0 && self.completed == self.total {
            RunStatus::Completed
        } else if self.failed > 0 {
            RunStatus::Attention
        } else if self.running > 0 {
            RunStatus::Running
        } else {
            previous
        }
    }

    /// Overwrite every derived field of `metadata`.
    pub fn apply_to(&self, metadata: &mut RunMetadata, at: Timestamp) {
        metadata.total_jobs = self.total;
        metadata.pending_jobs = self.pending();
        metadata.completed_jobs = self.completed;
        metadata.failed_jobs = self.failed;
        metadata.status = self.aggregate_status(metadata.status);
        metadata.last_activity = Some(at);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
