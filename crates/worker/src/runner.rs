//! The coordinator loop.
//!
//! One iteration scans runs in priority order, claims the first pending job
//! it can, executes it and reports the outcome. When nothing is claimable
//! the worker publishes an idle heartbeat and sleeps for the poll interval.
//! Cancellation is checked between iterations and interrupts the idle wait;
//! a job in flight always runs to completion.

use std::path::Path;
use std::sync::Arc;

use loom_core::audit::ManifestRow;
use loom_core::error::CoreError;
use loom_core::heartbeat::{WorkerHeartbeat, WorkerStatus, HEARTBEAT_VERSION};
use loom_core::job::{pending_in_scan_order, JobRecord, JobStatus};
use loom_core::types::now;
use loom_events::{event_types, EventBus, WorkerEvent};
use loom_store::registry::WorkerRegistry;
use loom_store::{RunManager, RunStateManifest, RunStore, StoreError};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::claim::{claim_job, finish_job};
use crate::config::{local_hostname, WorkerConfig};
use crate::executor::{ExecutionRequest, Executor, ExecutorError};
use crate::thumbnail::generate_thumbnail;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// How a claimed job ended before it is written back.
enum JobOutcome {
    Completed(Value),
    /// The renderer ran and reported failure.
    Failed(String),
    /// The worker itself could not carry the job through.
    Errored(RunnerError),
}

pub struct WorkerRunner {
    store: Arc<dyn RunStore>,
    registry: Arc<dyn WorkerRegistry>,
    run_state: Arc<RunStateManifest>,
    runs: RunManager,
    executor: Arc<dyn Executor>,
    events: Arc<EventBus>,
    config: WorkerConfig,
    hostname: String,
}

impl WorkerRunner {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<dyn WorkerRegistry>,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
    ) -> Self {
        let run_state = Arc::new(RunStateManifest::new(Arc::clone(&store)));
        let runs = RunManager::new(Arc::clone(&store), Arc::clone(&run_state));
        Self {
            store,
            registry,
            run_state,
            runs,
            executor,
            events: Arc::new(EventBus::default()),
            config,
            hostname: local_hostname(),
        }
    }

    /// Publish lifecycle events on `events` instead of a private bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `cancel` fires, or after one iteration in run-once mode.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            mode = %self.config.mode,
            store = %self.store.describe(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            once = self.config.once,
            "Worker started",
        );
        self.publish(
            WorkerEvent::new(event_types::STARTED, &self.config.worker_id).with_payload(json!({
                "mode": self.config.mode,
                "store": self.store.describe(),
            })),
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let processed = match self.run_once().await {
                Ok(job) => job.is_some(),
                Err(e) => {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "Worker iteration failed");
                    false
                }
            };

            if self.config.once {
                break;
            }
            if processed {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        self.publish(WorkerEvent::new(event_types::STOPPED, &self.config.worker_id));
    }

    /// One scan: claim and process at most one job.
    ///
    /// Returns the job in its terminal state, or `None` when nothing was
    /// claimable. A run whose ledger cannot be read is skipped; other store
    /// failures abandon the iteration. The worker is always reported idle
    /// once a claimed job has been handled.
    pub async fn run_once(&self) -> RunnerResult<Option<JobRecord>> {
        let run_ids = self.store.list_run_ids().await?;
        let ordered = self
            .run_state
            .prioritize_runs(&run_ids, self.config.preferred_run.as_deref())
            .await?;

        for run_id in &ordered {
            let jobs = match self.store.load_jobs(run_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Skipping run with unreadable ledger");
                    continue;
                }
            };
            let candidates = pending_in_scan_order(&jobs);
            tracing::debug!(run_id = %run_id, total = jobs.len(), pending = candidates.len(), "Scanned run");

            for job_id in candidates {
                let claimed =
                    claim_job(self.store.as_ref(), run_id, &job_id, &self.config.worker_id)
                        .await?;
                if let Some(job) = claimed {
                    let processed = self.process(job).await;
                    self.heartbeat(WorkerStatus::Idle, None).await;
                    return processed.map(Some);
                }
            }
        }

        tracing::debug!(runs = ordered.len(), "Nothing claimable");
        self.heartbeat(WorkerStatus::Idle, None).await;
        self.publish(WorkerEvent::new(event_types::IDLE, &self.config.worker_id));
        Ok(None)
    }

    async fn process(&self, job: JobRecord) -> RunnerResult<JobRecord> {
        let run_id = job.run_id.clone();
        let job_id = job.job_id.clone();
        tracing::info!(
            run_id = %run_id,
            job_id = %job_id,
            worker_id = %self.config.worker_id,
            "Job claimed",
        );
        self.heartbeat(WorkerStatus::Busy, Some(&job)).await;
        self.publish(
            WorkerEvent::new(event_types::JOB_CLAIMED, &self.config.worker_id)
                .with_job(&run_id, &job_id)
                .with_payload(json!({"sequence": job.sequence})),
        );

        let outcome = match self.execute(&job).await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Errored(e),
        };

        let (status, result, notes) = match &outcome {
            JobOutcome::Completed(result) => (JobStatus::Completed, result.clone(), None),
            JobOutcome::Failed(error) => {
                (JobStatus::Failed, json!({"error": error}), Some(error.clone()))
            }
            JobOutcome::Errored(e) => {
                let error = e.to_string();
                (JobStatus::Failed, json!({"error": error}), Some(error))
            }
        };

        let finished = finish_job(
            self.store.as_ref(),
            &run_id,
            &job_id,
            &self.config.worker_id,
            status,
            result.clone(),
            notes,
        )
        .await?;

        let worker = &self.config.worker_id;
        match outcome {
            JobOutcome::Completed(_) => {
                tracing::info!(run_id = %run_id, job_id = %job_id, "Job completed");
                self.publish(
                    WorkerEvent::new(event_types::JOB_COMPLETED, worker)
                        .with_job(&run_id, &job_id)
                        .with_payload(result),
                );
            }
            JobOutcome::Failed(error) => {
                tracing::warn!(run_id = %run_id, job_id = %job_id, error = %error, "Job failed");
                self.publish(
                    WorkerEvent::new(event_types::JOB_FAILED, worker)
                        .with_job(&run_id, &job_id)
                        .with_payload(result),
                );
            }
            JobOutcome::Errored(e) => {
                tracing::error!(run_id = %run_id, job_id = %job_id, error = %e, "Job errored");
                self.publish(
                    WorkerEvent::new(event_types::JOB_ERROR, worker)
                        .with_job(&run_id, &job_id)
                        .with_payload(result),
                );
            }
        }

        self.report(&finished).await?;
        Ok(finished)
    }

    /// Run the executor and collect the artifacts of a successful render.
    async fn execute(&self, job: &JobRecord) -> RunnerResult<JobOutcome> {
        let cache_root = self
            .store
            .ensure_local_cache(&job.run_id, &self.config.runs_cache_dir())
            .await?;
        let request = ExecutionRequest {
            job_id: job.job_id.clone(),
            run_id: job.run_id.clone(),
            config: job.config.clone(),
            cache_root,
            work_dir: self.config.work_dir(),
        };

        // A panicking executor surfaces as a join error instead of taking
        // the loop down.
        let executor = Arc::clone(&self.executor);
        let outcome = tokio::spawn(async move { executor.execute(&request).await })
            .await
            .map_err(|e| ExecutorError::Panicked(e.to_string()))??;

        tracing::debug!(
            job_id = %job.job_id,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "Executor finished",
        );
        if !outcome.succeeded() {
            return Ok(JobOutcome::Failed(outcome.error_text()));
        }

        let mut result = match outcome.report.result.clone() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(output_path) = outcome.report.output_path() {
            let output = Path::new(output_path);
            let uploaded = self.store.upload_output(&job.run_id, output).await?;
            result.insert("output_path".into(), json!(output_path));
            result.insert("uploaded".into(), json!(uploaded));
            if let Some(thumbnail) = self.upload_thumbnail(&job.run_id, output).await {
                result.insert("thumbnail".into(), json!(thumbnail));
            }
        } else {
            tracing::warn!(job_id = %job.job_id, "Executor succeeded without an output path");
        }
        Ok(JobOutcome::Completed(Value::Object(result)))
    }

    async fn upload_thumbnail(&self, run_id: &str, output: &Path) -> Option<String> {
        let thumb = generate_thumbnail(output).await?;
        let uploaded = match self.store.upload_thumbnail(run_id, &thumb).await {
            Ok(uploaded) => Some(uploaded),
            Err(e) => {
                tracing::warn!(run_id, error = %e, "Thumbnail upload failed");
                None
            }
        };
        if let Err(e) = tokio::fs::remove_file(&thumb).await {
            tracing::debug!(path = %thumb.display(), error = %e, "Could not remove local thumbnail");
        }
        uploaded
    }

    /// Audit row, recomputed run metadata and run-state activity.
    async fn report(&self, job: &JobRecord) -> RunnerResult<()> {
        let at = now();
        self.runs
            .append_manifest_entry(&job.run_id, &ManifestRow::from_job(job, at))
            .await?;
        let metadata = self.runs.recompute_run_metadata(&job.run_id).await?;
        self.run_state
            .record_activity(
                &job.run_id,
                metadata.status,
                metadata.last_activity.unwrap_or(at),
                &self.config.worker_id,
            )
            .await?;
        tracing::debug!(
            run_id = %job.run_id,
            status = %metadata.status,
            completed = metadata.completed_jobs,
            failed = metadata.failed_jobs,
            "Run metadata updated",
        );
        Ok(())
    }

    async fn heartbeat(&self, status: WorkerStatus, job: Option<&JobRecord>) {
        let heartbeat = WorkerHeartbeat {
            worker_id: self.config.worker_id.clone(),
            hostname: self.hostname.clone(),
            status,
            active_job_id: job.map(|j| j.job_id.clone()),
            run_id: job.map(|j| j.run_id.clone()),
            last_seen: now(),
            pid: std::process::id(),
            info: json!({"store": self.store.describe()}),
            mode: Some(self.config.mode.clone()),
            version: HEARTBEAT_VERSION,
        };
        if let Err(e) = self.registry.record_heartbeat(&heartbeat).await {
            tracing::warn!(worker_id = %self.config.worker_id, error = %e, "Heartbeat write failed");
        }
    }

    fn publish(&self, event: WorkerEvent) {
        self.events.publish(event);
    }
}
