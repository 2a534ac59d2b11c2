//! Worker heartbeat registry.
//!
//! Each worker overwrites one snapshot keyed by its id. Nothing here expires
//! snapshots; readers judge liveness with
//! [`WorkerHeartbeat::is_stale`](loom_core::heartbeat::WorkerHeartbeat::is_stale).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use loom_core::heartbeat::WorkerHeartbeat;
use tokio::fs;

use crate::error::{StoreError, StoreResult};
use crate::layout::{self, to_pretty_json, validate_file_name};
use crate::local::write_atomic;
use crate::s3::{S3Location, S3Objects};

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Replace this worker's snapshot.
    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> StoreResult<()>;

    /// All readable snapshots, sorted by worker id.
    async fn list_workers(&self) -> StoreResult<Vec<WorkerHeartbeat>>;
}

/// Build the registry for `uri`, using the same rule as
/// [`open_run_store`](crate::run_store::open_run_store).
pub async fn open_worker_registry(uri: &str) -> StoreResult<Arc<dyn WorkerRegistry>> {
    if uri.starts_with("s3://") {
        let location = S3Location::parse(uri)?;
        let client = crate::s3::default_client().await;
        let registry = S3WorkerRegistry::new(client, location);
        registry.objects.check_bucket().await?;
        Ok(Arc::new(registry))
    } else {
        Ok(Arc::new(LocalWorkerRegistry::open(uri).await?))
    }
}

fn snapshot_name(worker_id: &str) -> StoreResult<String> {
    let name = format!("{worker_id}.json");
    validate_file_name(&name)?;
    Ok(name)
}

fn parse_snapshot(source: &str, bytes: &[u8]) -> Option<WorkerHeartbeat> {
    match serde_json::from_slice(bytes) {
        Ok(heartbeat) => Some(heartbeat),
        Err(e) => {
            tracing::warn!(source, error = %e, "Skipping unreadable heartbeat");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Snapshots at `<base>/workers/<worker_id>.json`.
pub struct LocalWorkerRegistry {
    dir: PathBuf,
}

impl LocalWorkerRegistry {
    pub async fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = base_dir.into().join(layout::WORKERS_DIR);
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl WorkerRegistry for LocalWorkerRegistry {
    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> StoreResult<()> {
        let path = self.dir.join(snapshot_name(&heartbeat.worker_id)?);
        write_atomic(&path, &to_pretty_json(heartbeat)?).await
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerHeartbeat>> {
        let mut workers = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(workers),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_snapshot {
                continue;
            }
            let source = path.display().to_string();
            match fs::read(&path).await {
                Ok(bytes) => workers.extend(parse_snapshot(&source, &bytes)),
                Err(e) => tracing::warn!(source, error = %e, "Skipping unreadable heartbeat"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

/// Snapshots at `<prefix>/workers/<worker_id>.json`.
pub struct S3WorkerRegistry {
    objects: S3Objects,
    location: S3Location,
}

impl S3WorkerRegistry {
    pub fn new(client: Client, location: S3Location) -> Self {
        Self {
            objects: S3Objects::new(client, location.bucket.clone()),
            location,
        }
    }
}

#[async_trait]
impl WorkerRegistry for S3WorkerRegistry {
    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> StoreResult<()> {
        snapshot_name(&heartbeat.worker_id)?;
        let key = self.location.worker_key(&heartbeat.worker_id);
        self.objects
            .put(&key, to_pretty_json(heartbeat)?, "application/json")
            .await
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerHeartbeat>> {
        let prefix = format!("{}/", self.location.key(layout::WORKERS_DIR));
        let mut workers = Vec::new();
        for key in self.objects.list_keys(&prefix).await? {
            if !key.ends_with(".json") {
                continue;
            }
            match self.objects.get(&key).await {
                Ok(Some((bytes, _))) => workers.extend(parse_snapshot(&key, &bytes)),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable heartbeat"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use loom_core::heartbeat::{WorkerStatus, HEARTBEAT_VERSION};
    use loom_core::types::now;

    use super::*;

    fn heartbeat(worker_id: &str, status: WorkerStatus) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            hostname: "render-01".to_string(),
            status,
            active_job_id: None,
            run_id: None,
            last_seen: now(),
            pid: std::process::id(),
            info: serde_json::json!({}),
            mode: Some("client".to_string()),
            version: HEARTBEAT_VERSION,
        }
    }

    #[tokio::test]
    async fn heartbeat_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = LocalWorkerRegistry::open(dir.path()).await.expect("open");

        registry
            .record_heartbeat(&heartbeat("w1", WorkerStatus::Idle))
            .await
            .expect("first");
        registry
            .record_heartbeat(&heartbeat("w1", WorkerStatus::Busy))
            .await
            .expect("second");
        registry
            .record_heartbeat(&heartbeat("w0", WorkerStatus::Idle))
            .await
            .expect("other");

        let workers = registry.list_workers().await.expect("list");
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].worker_id, "w0");
        assert_eq!(workers[1].status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn unreadable_snapshots_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = LocalWorkerRegistry::open(dir.path()).await.expect("open");
        registry
            .record_heartbeat(&heartbeat("w1", WorkerStatus::Idle))
            .await
            .expect("record");
        std::fs::write(dir.path().join("workers").join("broken.json"), b"{not json")
            .expect("write garbage");

        let workers = registry.list_workers().await.expect("list");
        assert_eq!(workers.len(), 1);
    }

    #[tokio::test]
    async fn worker_ids_with_separators_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = LocalWorkerRegistry::open(dir.path()).await.expect("open");
        assert!(registry
            .record_heartbeat(&heartbeat("../escape", WorkerStatus::Idle))
            .await
            .is_err());
    }
}
