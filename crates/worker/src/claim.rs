//! Ledger mutations made by a worker.
//!
//! Both the claim and the terminal report rewrite the whole ledger with a
//! conditional write against the version that was read. A rejected write
//! means another worker touched the ledger in between, so the ledger is
//! re-read and the job re-checked.

use std::time::Duration;

use loom_core::error::CoreError;
use loom_core::job::{find_job_mut, update_job_status, JobRecord, JobStatus};
use loom_store::{RunStore, StoreError, StoreResult};

/// Conditional-write attempts before giving up on a claim.
pub const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Conditional-write attempts for a terminal transition.
pub const MAX_REPORT_ATTEMPTS: usize = 10;

/// Base delay between report attempts, scaled by the attempt number.
const REPORT_BACKOFF: Duration = Duration::from_millis(50);

/// Transition `job_id` from pending to running for `worker_id`.
///
/// Returns `None` when the job is gone, no longer pending, or the ledger
/// kept changing underneath every attempt. Losing a claim is not an error.
pub async fn claim_job(
    store: &dyn RunStore,
    run_id: &str,
    job_id: &str,
    worker_id: &str,
) -> StoreResult<Option<JobRecord>> {
    for attempt in 1..=MAX_CLAIM_ATTEMPTS {
        let (mut jobs, version) = store.load_jobs_versioned(run_id).await?;
        let Some(job) = find_job_mut(&mut jobs, job_id) else {
            tracing::debug!(run_id, job_id, "Job vanished before claim");
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(
                run_id,
                job_id,
                status = %job.status,
                owner = ?job.worker,
                "Claim lost, job no longer pending"
            );
            return Ok(None);
        }

        update_job_status(job, JobStatus::Running, Some(worker_id), None)?;
        let claimed = job.clone();
        if store.save_jobs_if(run_id, &jobs, &version).await? {
            return Ok(Some(claimed));
        }
        tracing::debug!(run_id, job_id, attempt, "Ledger changed during claim, re-checking");
    }

    tracing::debug!(run_id, job_id, "Claim abandoned after repeated ledger conflicts");
    Ok(None)
}

/// Move a running job owned by `worker_id` to a terminal `status`.
///
/// `notes` replaces the job's notes when given.
pub async fn finish_job(
    store: &dyn RunStore,
    run_id: &str,
    job_id: &str,
    worker_id: &str,
    status: JobStatus,
    result: serde_json::Value,
    notes: Option<String>,
) -> StoreResult<JobRecord> {
    for attempt in 1..=MAX_REPORT_ATTEMPTS {
        let (mut jobs, version) = store.load_jobs_versioned(run_id).await?;
        let job = find_job_mut(&mut jobs, job_id).ok_or_else(|| CoreError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;

        update_job_status(job, status, Some(worker_id), Some(result.clone()))?;
        if let Some(notes) = &notes {
            job.notes = Some(notes.clone());
        }
        let finished = job.clone();
        if store.save_jobs_if(run_id, &jobs, &version).await? {
            return Ok(finished);
        }

        tracing::debug!(run_id, job_id, attempt, "Ledger changed during report, retrying");
        tokio::time::sleep(REPORT_BACKOFF * attempt as u32).await;
    }

    Err(StoreError::Core(CoreError::Internal(format!(
        "Ledger for run {run_id} kept changing while reporting job {job_id}"
    ))))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
