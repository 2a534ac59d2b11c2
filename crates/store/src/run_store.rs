//! The [`RunStore`] trait: every durable read and write a worker or operator
//! tool performs against run data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use loom_core::audit::ManifestRow;
use loom_core::job::JobRecord;
use loom_core::run::RunMetadata;
use loom_core::run_state::RunStateDocument;

use crate::error::StoreResult;
use crate::local::LocalRunStore;
use crate::s3::{S3Location, S3RunStore};

/// Opaque token identifying one observed state of a ledger.
///
/// Local stores use a SHA-256 digest of the file bytes, S3 uses the ETag.
/// `None` means the ledger did not exist when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerVersion(Option<String>);

impl LedgerVersion {
    pub fn missing() -> Self {
        Self(None)
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self(Some(tag.into()))
    }

    pub fn as_tag(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_missing(&self) -> bool {
        self.0.is_none()
    }
}

/// Durable storage for runs, shared by every worker.
///
/// Ledgers (`jobs.json`) and metadata (`run.json`) are always read and
/// written whole. A missing ledger reads as empty.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Human-readable location, e.g. `local:/srv/loom`.
    fn describe(&self) -> String;

    /// Sorted ids of all runs.
    async fn list_run_ids(&self) -> StoreResult<Vec<String>>;

    async fn load_jobs(&self, run_id: &str) -> StoreResult<Vec<JobRecord>> {
        Ok(self.load_jobs_versioned(run_id).await?.0)
    }

    async fn load_jobs_versioned(&self, run_id: &str)
        -> StoreResult<(Vec<JobRecord>, LedgerVersion)>;

    /// Unconditionally replace the ledger.
    async fn save_jobs(&self, run_id: &str, jobs: &[JobRecord]) -> StoreResult<()>;

    /// Replace the ledger only if it is still at `expected`. Returns `false`
    /// when another writer got there first.
    async fn save_jobs_if(
        &self,
        run_id: &str,
        jobs: &[JobRecord],
        expected: &LedgerVersion,
    ) -> StoreResult<bool>;

    async fn load_metadata(&self, run_id: &str) -> StoreResult<Option<RunMetadata>>;

    async fn save_metadata(&self, run_id: &str, metadata: &RunMetadata) -> StoreResult<()>;

    /// Make the run's `configs/` tree available on local disk and return the
    /// directory that contains it.
    async fn ensure_local_cache(&self, run_id: &str, cache_root: &Path) -> StoreResult<PathBuf>;

    /// Copy a rendered artifact into the run's `outputs/`.
    async fn upload_output(&self, run_id: &str, file: &Path) -> StoreResult<String>;

    /// Copy a thumbnail into the run's `thumbnails/`.
    async fn upload_thumbnail(&self, run_id: &str, file: &Path) -> StoreResult<String>;

    /// Read an auxiliary file such as `notes.md`. `None` if absent.
    async fn read_run_file(&self, run_id: &str, name: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn write_run_file(&self, run_id: &str, name: &str, contents: &[u8]) -> StoreResult<()>;

    /// Append one row to `manifest.csv`, writing the header first if the
    /// file does not exist yet.
    async fn append_manifest_row(&self, run_id: &str, row: &ManifestRow) -> StoreResult<()>;

    /// The shared run-state document. Missing or unreadable loads as default.
    async fn load_run_state(&self) -> StoreResult<RunStateDocument>;

    async fn save_run_state(&self, document: &RunStateDocument) -> StoreResult<()>;

    /// The shared run-id counter, if one has been written.
    async fn read_counter(&self) -> StoreResult<Option<u64>>;

    async fn write_counter(&self, value: u64) -> StoreResult<()>;
}

/// Build the store for `uri`: `s3://bucket[/prefix]` selects S3, anything
/// else is a local base directory. An S3 bucket that cannot be reached is
/// an error here.
pub async fn open_run_store(uri: &str) -> StoreResult<Arc<dyn RunStore>> {
    if uri.starts_with("s3://") {
        let location = S3Location::parse(uri)?;
        let client = crate::s3::default_client().await;
        let store = S3RunStore::new(client, location);
        store.check_access().await?;
        tracing::info!(
            bucket = %store.location().bucket,
            prefix = %store.location().prefix,
            "Using S3 run store"
        );
        Ok(Arc::new(store))
    } else {
        let store = LocalRunStore::open(uri).await?;
        tracing::info!(location = %store.describe(), "Using local run store");
        Ok(Arc::new(store))
    }
}
