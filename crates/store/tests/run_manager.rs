//! Integration tests for run creation and run-id allocation.

use std::sync::Arc;

use assert_matches::assert_matches;
use loom_core::job::JobStatus;
use loom_core::run::RunStatus;
use loom_store::{LocalRunStore, NewRun, RunManager, RunStateManifest, RunStore};
use serde_json::json;

struct Fixture {
    dir: tempfile::TempDir,
    store: Arc<dyn RunStore>,
    run_state: Arc<RunStateManifest>,
    manager: RunManager,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::open(dir.path()).await.expect("open"));
    let run_state = Arc::new(RunStateManifest::new(Arc::clone(&store)));
    let manager = RunManager::new(Arc::clone(&store), Arc::clone(&run_state));
    Fixture {
        dir,
        store,
        run_state,
        manager,
    }
}

// ---------------------------------------------------------------------------
// allocate_run_id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn allocation_scans_existing_runs_without_counter() {
    let fx = fixture().await;
    for n in 1..=7 {
        std::fs::create_dir_all(fx.dir.path().join("runs").join(format!("{n:04}"))).expect("mkdir");
    }

    assert_eq!(fx.manager.allocate_run_id().await.expect("allocate"), "0008");
    assert_eq!(fx.store.read_counter().await.expect("counter"), Some(8));
    assert_eq!(fx.manager.allocate_run_id().await.expect("allocate"), "0009");
}

#[tokio::test]
async fn allocation_never_goes_below_a_higher_counter() {
    let fx = fixture().await;
    std::fs::create_dir_all(fx.dir.path().join("runs/0002")).expect("mkdir");
    fx.store.write_counter(40).await.expect("counter");

    assert_eq!(fx.manager.allocate_run_id().await.expect("allocate"), "0041");
}

#[tokio::test]
async fn allocation_recovers_from_a_stale_counter() {
    let fx = fixture().await;
    std::fs::create_dir_all(fx.dir.path().join("runs/0015")).expect("mkdir");
    fx.store.write_counter(3).await.expect("counter");

    assert_eq!(fx.manager.allocate_run_id().await.expect("allocate"), "0016");
}

#[tokio::test]
async fn host_counter_participates_and_is_updated() {
    let fx = fixture().await;
    let host_dir = tempfile::tempdir().expect("host dir");
    let host_counter = host_dir.path().join("loom").join("counter");
    std::fs::create_dir_all(host_counter.parent().expect("parent")).expect("mkdir");
    std::fs::write(&host_counter, "20\n").expect("host counter");

    let manager = RunManager::new(Arc::clone(&fx.store), Arc::clone(&fx.run_state))
        .with_host_counter(&host_counter);
    assert_eq!(manager.allocate_run_id().await.expect("allocate"), "0021");
    assert_eq!(std::fs::read_to_string(&host_counter).expect("read").trim(), "21");
    assert_eq!(fx.store.read_counter().await.expect("counter"), Some(21));
}

#[tokio::test]
async fn concurrent_allocations_are_unique() {
    let fx = fixture().await;
    let manager = Arc::new(fx.manager);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.allocate_run_id().await.expect("allocate") })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join"));
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

// ---------------------------------------------------------------------------
// create_run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_run_writes_every_file() {
    let fx = fixture().await;
    let created = fx
        .manager
        .create_run(NewRun {
            note: "  spring denim  ".into(),
            garment: Some("shirt".into()),
            fabrics: vec!["silk".into(), "denim".into(), "silk".into()],
            views: vec!["front".into()],
            configs: vec![
                json!({"garment": "shirt", "fabric": "denim", "view": "front"}),
                json!({"garment": "shirt", "fabric": "silk", "view": "front", "tags": ["a"]}),
            ],
            extra: Some(json!({"batch": "spring"})),
            priority: Some(7),
            ..NewRun::default()
        })
        .await
        .expect("create");

    assert_eq!(created.run_id, "0001");
    assert_eq!(created.jobs.len(), 2);
    assert!(created.jobs.iter().all(|j| j.status == JobStatus::Pending));

    let meta = fx
        .store
        .load_metadata("0001")
        .await
        .expect("load")
        .expect("metadata");
    assert_eq!(meta.status, RunStatus::Pending);
    assert_eq!(meta.total_jobs, 2);
    assert_eq!(meta.pending_jobs, 2);
    assert_eq!(meta.note, "spring denim");
    assert_eq!(meta.fabrics, vec!["denim", "silk"]);
    assert_eq!(meta.extra, Some(json!({"batch": "spring"})));
    assert!(meta.created_at.is_some());
    assert!(meta.created_by.is_some());

    assert_eq!(fx.store.load_jobs("0001").await.expect("jobs"), created.jobs);

    let run_dir = fx.dir.path().join("runs/0001");
    assert_eq!(
        std::fs::read_to_string(run_dir.join("notes.md")).expect("notes"),
        "# Run 0001\n\nspring denim\n"
    );
    let plan: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("plan.json")).expect("plan")).expect("json");
    assert_eq!(plan[1]["tags"], "[\"a\"]");
    assert_eq!(
        std::fs::read_to_string(run_dir.join("manifest.csv")).expect("manifest"),
        "timestamp,status,garment,fabric,asset,view,output,worker,notes\n"
    );

    let document = fx.run_state.load().await.expect("state");
    assert_eq!(document.entry("0001").and_then(|e| e.priority), Some(7));
}

#[tokio::test]
async fn empty_note_gets_placeholder() {
    let fx = fixture().await;
    let created = fx.manager.create_run(NewRun::default()).await.expect("create");
    let notes = fx
        .store
        .read_run_file(&created.run_id, "notes.md")
        .await
        .expect("read")
        .expect("notes");
    assert_eq!(notes, b"# Run 0001\n\n(no notes provided)\n".to_vec());
    assert_eq!(created.metadata.total_jobs, 0);
}

// ---------------------------------------------------------------------------
// Metadata helpers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_merges_keys_and_keeps_unknown_ones() {
    let fx = fixture().await;
    let created = fx.manager.create_run(NewRun::default()).await.expect("create");

    let mut updates = serde_json::Map::new();
    updates.insert("note".into(), json!("reshoot"));
    updates.insert("reviewer".into(), json!("kim"));
    let updated = fx
        .manager
        .update_run_metadata(&created.run_id, updates)
        .await
        .expect("update");

    assert_eq!(updated.note, "reshoot");
    assert_eq!(updated.other["reviewer"], "kim");
    assert_eq!(updated.created_at, created.metadata.created_at);
}

#[tokio::test]
async fn summarize_missing_run_is_minimal() {
    let fx = fixture().await;
    let meta = fx.manager.summarize_run("0099").await.expect("summary");
    assert_eq!(meta.run_id, "0099");
    assert_eq!(meta.status, RunStatus::Pending);
}

#[tokio::test]
async fn update_rejects_malformed_values() {
    let fx = fixture().await;
    let created = fx.manager.create_run(NewRun::default()).await.expect("create");
    let mut updates = serde_json::Map::new();
    updates.insert("total_jobs".into(), json!("many"));
    assert_matches!(
        fx.manager.update_run_metadata(&created.run_id, updates).await,
        Err(loom_store::StoreError::Json(_))
    );
}
