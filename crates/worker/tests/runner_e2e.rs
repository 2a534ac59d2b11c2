//! End-to-end runs of the coordinator loop against a local store and stub
//! executors.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use loom_core::executor::ExecutorReport;
use loom_core::heartbeat::WorkerStatus;
use loom_core::job::JobStatus;
use loom_core::run::RunStatus;
use loom_events::{event_types, EventBus, WorkerEvent};
use loom_store::registry::LocalWorkerRegistry;
use loom_store::{LocalRunStore, NewRun, RunManager, RunStateManifest, RunStore, WorkerRegistry};
use loom_worker::{ExecutionOutcome, ExecutionRequest, Executor, ExecutorError, WorkerConfig, WorkerRunner};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Stub executors
// ---------------------------------------------------------------------------

/// Writes a small PNG per job and reports success.
struct RenderingExecutor {
    out_dir: PathBuf,
}

#[async_trait]
impl Executor for RenderingExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        std::fs::create_dir_all(&self.out_dir)?;
        let output = self.out_dir.join(format!("{}.png", request.job_id));
        image::RgbImage::from_pixel(64, 32, image::Rgb([10, 120, 200]))
            .save(&output)
            .map_err(|e| ExecutorError::InvalidReport(e.to_string()))?;
        Ok(outcome(
            ExecutorReport {
                success: true,
                result: Some(json!({"output_path": output.to_str().unwrap_or_default()})),
                error: None,
            },
            0,
        ))
    }
}

/// Always reports a failed render.
struct FailingExecutor;

#[async_trait]
impl Executor for FailingExecutor {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        Ok(outcome(
            ExecutorReport {
                success: false,
                result: None,
                error: Some("render crashed".into()),
            },
            1,
        ))
    }
}

struct PanickingExecutor;

#[async_trait]
impl Executor for PanickingExecutor {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        panic!("renderer bindings blew up");
    }
}

/// Stands in for a render killed at its wall-clock limit.
struct TimedOutExecutor;

#[async_trait]
impl Executor for TimedOutExecutor {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        Err(ExecutorError::Timeout { elapsed_ms: 900_000 })
    }
}

fn outcome(report: ExecutorReport, exit_code: i32) -> ExecutionOutcome {
    ExecutionOutcome {
        report,
        exit_code,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 1,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Farm {
    dir: tempfile::TempDir,
    scratch: tempfile::TempDir,
    store: Arc<dyn RunStore>,
    registry: Arc<dyn WorkerRegistry>,
    run_state: Arc<RunStateManifest>,
}

impl Farm {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = tempfile::tempdir().expect("scratch");
        let store: Arc<dyn RunStore> =
            Arc::new(LocalRunStore::open(dir.path()).await.expect("store"));
        let registry: Arc<dyn WorkerRegistry> =
            Arc::new(LocalWorkerRegistry::open(dir.path()).await.expect("registry"));
        let run_state = Arc::new(RunStateManifest::new(Arc::clone(&store)));
        Self {
            dir,
            scratch,
            store,
            registry,
            run_state,
        }
    }

    async fn submit(&self, views: &[&str]) -> String {
        let manager = RunManager::new(Arc::clone(&self.store), Arc::clone(&self.run_state));
        let configs = views
            .iter()
            .map(|view| json!({"garment": "shirt", "fabric": "denim", "view": view}))
            .collect();
        manager
            .create_run(NewRun {
                note: "e2e".into(),
                configs,
                ..NewRun::default()
            })
            .await
            .expect("create run")
            .run_id
    }

    fn worker(&self, worker_id: &str, executor: Arc<dyn Executor>) -> WorkerRunner {
        let mut config = WorkerConfig::new(worker_id, self.scratch.path().join(worker_id));
        config.once = true;
        WorkerRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            executor,
            config,
        )
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.path().join("runs").join(run_id)
    }
}

fn drain(receiver: &mut broadcast::Receiver<WorkerEvent>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        types.push(event.event_type);
    }
    types
}

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_single_job_passes_complete_the_run() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front", "back"]).await;
    let executor = Arc::new(RenderingExecutor {
        out_dir: farm.scratch.path().join("renders"),
    });

    let events = Arc::new(EventBus::default());
    let mut receiver = events.subscribe();
    let runner = farm.worker("w1", executor).with_events(Arc::clone(&events));
    runner.run(CancellationToken::new()).await;
    runner.run(CancellationToken::new()).await;

    let jobs = farm.store.load_jobs(&run_id).await.expect("jobs");
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs.iter().all(|j| j.worker.as_deref() == Some("w1")));

    let result = jobs[0].result.as_ref().expect("result");
    let uploaded = PathBuf::from(result["uploaded"].as_str().expect("uploaded"));
    assert!(uploaded.starts_with(farm.run_dir(&run_id).join("outputs")));
    assert!(uploaded.exists());
    let thumbnail = PathBuf::from(result["thumbnail"].as_str().expect("thumbnail"));
    assert!(thumbnail.starts_with(farm.run_dir(&run_id).join("thumbnails")));
    assert!(thumbnail.to_string_lossy().ends_with("_thumb.jpg"));

    let meta = farm
        .store
        .load_metadata(&run_id)
        .await
        .expect("load")
        .expect("metadata");
    assert_eq!(meta.total_jobs, 2);
    assert_eq!(meta.completed_jobs, 2);
    assert_eq!(meta.pending_jobs, 0);
    assert_eq!(meta.status, RunStatus::Completed);

    let document = farm.run_state.load().await.expect("state");
    let entry = document.entry(&run_id).expect("entry");
    assert_eq!(entry.status, Some(RunStatus::Completed));
    assert_eq!(entry.last_worker.as_deref(), Some("w1"));

    let types = drain(&mut receiver);
    assert_eq!(
        types,
        vec![
            event_types::STARTED,
            event_types::JOB_CLAIMED,
            event_types::JOB_COMPLETED,
            event_types::STOPPED,
            event_types::STARTED,
            event_types::JOB_CLAIMED,
            event_types::JOB_COMPLETED,
            event_types::STOPPED,
        ]
    );
}

#[tokio::test]
async fn empty_scan_records_idle_heartbeat() {
    let farm = Farm::new().await;
    let runner = farm.worker("w-idle", Arc::new(FailingExecutor));

    assert!(runner.run_once().await.expect("scan").is_none());

    let workers = farm.registry.list_workers().await.expect("workers");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "w-idle");
    assert_eq!(workers[0].status, WorkerStatus::Idle);
    assert_eq!(workers[0].active_job_id, None);
    assert_eq!(workers[0].pid, std::process::id());
}

#[tokio::test]
async fn worker_returns_to_idle_after_each_job() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front"]).await;
    let runner = farm.worker("w-busy", Arc::new(FailingExecutor));

    let job = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(job.run_id, run_id);

    let workers = farm.registry.list_workers().await.expect("workers");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Idle);
    assert_eq!(workers[0].active_job_id, None);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreadable_ledger_does_not_block_other_runs() {
    let farm = Farm::new().await;
    let broken = farm.submit(&["front"]).await;
    let healthy = farm.submit(&["front"]).await;
    std::fs::write(farm.run_dir(&broken).join("jobs.json"), "{garbage").expect("corrupt");

    let runner = farm.worker("w-skip", Arc::new(FailingExecutor));
    let job = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(job.run_id, healthy);
    assert!(runner.run_once().await.expect("iteration").is_none());
}

#[tokio::test]
async fn failing_executor_marks_run_for_attention() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front", "back"]).await;
    let runner = farm.worker("w2", Arc::new(FailingExecutor));

    runner.run(CancellationToken::new()).await;
    runner.run(CancellationToken::new()).await;

    let jobs = farm.store.load_jobs(&run_id).await.expect("jobs");
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result, Some(json!({"error": "render crashed"})));
        assert_eq!(job.notes.as_deref(), Some("render crashed"));
        assert!(job.finished_at.is_some());
    }

    let meta = farm
        .store
        .load_metadata(&run_id)
        .await
        .expect("load")
        .expect("metadata");
    assert_eq!(meta.status, RunStatus::Attention);
    assert_eq!(meta.failed_jobs, 2);

    let manifest =
        std::fs::read_to_string(farm.run_dir(&run_id).join("manifest.csv")).expect("manifest");
    let mut reader = csv::Reader::from_reader(manifest.as_bytes());
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(&row[1], "failed");
        assert_eq!(&row[2], "shirt");
        assert_eq!(&row[7], "w2");
        assert_eq!(&row[8], "render crashed");
    }
}

#[tokio::test]
async fn executor_panic_fails_only_the_job() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front"]).await;

    let events = Arc::new(EventBus::default());
    let mut receiver = events.subscribe();
    let runner = farm
        .worker("w3", Arc::new(PanickingExecutor))
        .with_events(Arc::clone(&events));

    let finished = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(finished.status, JobStatus::Failed);
    assert!(finished
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("panicked")));

    let jobs = farm.store.load_jobs(&run_id).await.expect("jobs");
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(drain(&mut receiver).contains(&event_types::JOB_ERROR.to_string()));
}

#[tokio::test]
async fn timed_out_render_fails_the_job() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front"]).await;

    let events = Arc::new(EventBus::default());
    let mut receiver = events.subscribe();
    let runner = farm
        .worker("w-slow", Arc::new(TimedOutExecutor))
        .with_events(Arc::clone(&events));

    let finished = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.notes.as_deref(),
        Some("Executor timed out after 900000 ms")
    );
    assert!(drain(&mut receiver).contains(&event_types::JOB_ERROR.to_string()));

    let meta = farm
        .store
        .load_metadata(&run_id)
        .await
        .expect("load")
        .expect("metadata");
    assert_eq!(meta.status, RunStatus::Attention);
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_runs_are_skipped_and_priority_orders_runs() {
    let farm = Farm::new().await;
    let first = farm.submit(&["front"]).await;
    let second = farm.submit(&["front"]).await;
    let third = farm.submit(&["front"]).await;

    farm.run_state.pause_run(&first, true).await.expect("pause");
    farm.run_state.set_run_priority(&third, 1).await.expect("priority");

    let runner = farm.worker("w4", Arc::new(FailingExecutor));
    let job = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(job.run_id, third);
    let job = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(job.run_id, second);
    assert!(runner.run_once().await.expect("iteration").is_none());

    let paused = farm.store.load_jobs(&first).await.expect("jobs");
    assert_eq!(paused[0].status, JobStatus::Pending);
}

#[tokio::test]
async fn preferred_run_is_scanned_first() {
    let farm = Farm::new().await;
    let _first = farm.submit(&["front"]).await;
    let second = farm.submit(&["front"]).await;

    let mut config = WorkerConfig::new("w5", farm.scratch.path().join("w5"));
    config.preferred_run = Some(second.clone());
    let runner = WorkerRunner::new(
        Arc::clone(&farm.store),
        Arc::clone(&farm.registry),
        Arc::new(FailingExecutor),
        config,
    );

    let job = runner.run_once().await.expect("iteration").expect("job");
    assert_eq!(job.run_id, second);
}

#[tokio::test]
async fn jobs_within_a_run_run_in_sequence_order() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front", "side", "back"]).await;
    let runner = farm.worker("w6", Arc::new(FailingExecutor));

    let mut sequences = Vec::new();
    while let Some(job) = runner.run_once().await.expect("iteration") {
        assert_eq!(job.run_id, run_id);
        sequences.push(job.sequence);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn cancelled_worker_stops_without_claiming() {
    let farm = Farm::new().await;
    let run_id = farm.submit(&["front"]).await;

    let mut config = WorkerConfig::new("w7", farm.scratch.path().join("w7"));
    config.once = false;
    let runner = WorkerRunner::new(
        Arc::clone(&farm.store),
        Arc::clone(&farm.registry),
        Arc::new(FailingExecutor),
        config,
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    runner.run(cancel).await;

    let jobs = farm.store.load_jobs(&run_id).await.expect("jobs");
    assert_eq!(jobs[0].status, JobStatus::Pending);
}
