//! Worker heartbeat snapshots and reader-side liveness judgments.
//!
//! Writers never expire heartbeats. Whether a worker is alive is decided by
//! whoever reads the snapshot, by comparing `last_seen` against a timeout.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{JobRecord, JobStatus};
use crate::types::Timestamp;

/// If a worker has not sent a heartbeat within this many seconds,
/// it is considered offline.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 120;

/// Schema version written into every heartbeat.
pub const HEARTBEAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// Anything a newer or older worker may have written.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unknown => "unknown",
        })
    }
}

/// One full liveness snapshot, overwritten on every loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    #[serde(default)]
    pub hostname: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub active_job_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub last_seen: Timestamp,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub info: serde_json::Value,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    HEARTBEAT_VERSION
}

impl WorkerHeartbeat {
    /// Seconds since `last_seen`, clamped at zero for clock skew.
    pub fn age_secs(&self, now: Timestamp) -> u64 {
        (now - self.last_seen).num_seconds().max(0) as u64
    }

    pub fn is_stale(&self, now: Timestamp, timeout_secs: u64) -> bool {
        self.age_secs(now) > timeout_secs
    }
}

// ---------------------------------------------------------------------------
// Orphan report
// ---------------------------------------------------------------------------

/// Why a running job looks abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    /// The owning worker never published a heartbeat.
    NoHeartbeat,
    /// The owner's last heartbeat is older than the timeout.
    StaleHeartbeat { age_secs: u64 },
    /// The owner is alive but reports a different active job.
    OwnerMovedOn { active_job_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedJob {
    pub run_id: String,
    pub job_id: String,
    pub worker: Option<String>,
    pub reason: OrphanReason,
}

/// List `running` jobs whose owner no longer appears to be working on them.
///
/// This is a read-only report. Nothing is reclaimed automatically.
pub fn find_orphaned_jobs(
    jobs: &[JobRecord],
    heartbeats: &[WorkerHeartbeat],
    now: Timestamp,
    timeout_secs: u64,
) -> Vec<OrphanedJob> {
    let by_worker: HashMap<&str, &WorkerHeartbeat> = heartbeats
        .iter()
        .map(|hb| (hb.worker_id.as_str(), hb))
        .collect();

    jobs.iter()
        .filter(|job| job.status == JobStatus::Running)
        .filter_map(|job| {
            let owner = job.worker.as_deref();
            let reason = match owner.and_then(|w| by_worker.get(w)) {
                None => OrphanReason::NoHeartbeat,
                Some(hb) if hb.is_stale(now, timeout_secs) => OrphanReason::StaleHeartbeat {
                    age_secs: hb.age_secs(now),
                },
                Some(hb) if hb.active_job_id.as_deref() != Some(job.job_id.as_str()) => {
                    OrphanReason::OwnerMovedOn {
                        active_job_id: hb.active_job_id.clone(),
                    }
                }
                Some(_) => return None,
            };
            Some(OrphanedJob {
                run_id: job.run_id.clone(),
                job_id: job.job_id.clone(),
                worker: job.worker.clone(),
                reason,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
