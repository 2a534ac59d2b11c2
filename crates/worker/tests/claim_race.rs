//! Concurrent claims against the same ledger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_core::executor::ExecutorReport;
use loom_core::job::{expand_configs_to_jobs, JobStatus};
use loom_store::registry::LocalWorkerRegistry;
use loom_store::{LocalRunStore, RunStore, WorkerRegistry};
use loom_worker::claim::claim_job;
use loom_worker::{ExecutionOutcome, ExecutionRequest, Executor, ExecutorError, WorkerConfig, WorkerRunner};
use serde_json::json;

struct SlowExecutor;

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ExecutionOutcome {
            report: ExecutorReport {
                success: true,
                result: None,
                error: None,
            },
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 50,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_concurrent_claim_wins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(LocalRunStore::open(dir.path()).await.expect("open"));
    let jobs = expand_configs_to_jobs("0001", [json!({"view": "front"})]);
    store.save_jobs("0001", &jobs).await.expect("seed");
    let job_id = jobs[0].job_id.clone();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = Arc::clone(&store);
            let job_id = job_id.clone();
            tokio::spawn(async move {
                let worker = format!("w{n}");
                claim_job(store.as_ref(), "0001", &job_id, &worker)
                    .await
                    .expect("claim")
                    .map(|_| worker)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(worker) = handle.await.expect("join") {
            winners.push(worker);
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = store.load_jobs("0001").await.expect("load");
    assert_eq!(stored[0].status, JobStatus::Running);
    assert_eq!(stored[0].worker.as_deref(), Some(winners[0].as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_workers_process_each_job_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let scratch = tempfile::tempdir().expect("scratch");
    let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::open(dir.path()).await.expect("open"));
    let registry: Arc<dyn WorkerRegistry> =
        Arc::new(LocalWorkerRegistry::open(dir.path()).await.expect("registry"));
    let jobs = expand_configs_to_jobs("0001", (0..4).map(|n| json!({"view": n})));
    store.save_jobs("0001", &jobs).await.expect("seed");

    let handles: Vec<_> = (0..3)
        .map(|n| {
            let worker_id = format!("w{n}");
            let runner = WorkerRunner::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::new(SlowExecutor),
                WorkerConfig::new(&worker_id, scratch.path().join(&worker_id)),
            );
            tokio::spawn(async move {
                let mut processed = Vec::new();
                while let Some(job) = runner.run_once().await.expect("iteration") {
                    processed.push(job.job_id);
                }
                processed
            })
        })
        .collect();

    let mut processed = Vec::new();
    for handle in handles {
        processed.extend(handle.await.expect("join"));
    }
    processed.sort();
    let mut expected: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
    expected.sort();
    assert_eq!(processed, expected);

    let stored = store.load_jobs("0001").await.expect("load");
    assert!(stored.iter().all(|j| j.status == JobStatus::Completed));
}
