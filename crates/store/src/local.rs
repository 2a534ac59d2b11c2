//! Local-disk backend.
//!
//! Directory structure:
//!   {base_dir}/runs/{run_id}/jobs.json, run.json, ...
//!   {base_dir}/runs/state.json
//!   {base_dir}/runs/.counter
//!   {base_dir}/workers/{worker_id}.json
//!
//! Every whole-file write goes through a temp file and a rename, so readers
//! never observe a half-written ledger. Conditional ledger writes are
//! serialized by a `jobs.json.lock` file created with `create_new`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loom_core::audit::ManifestRow;
use loom_core::job::JobRecord;
use loom_core::run::{is_run_id, RunMetadata};
use loom_core::run_state::RunStateDocument;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{StoreError, StoreResult};
use crate::layout::{self, artifact_name, encode_manifest_row, to_pretty_json, validate_file_name};
use crate::run_store::{LedgerVersion, RunStore};

/// A lock file older than this is assumed to belong to a crashed writer.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long a writer waits for a live lock before giving up.
const LOCK_WAIT_LIMIT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

pub struct LocalRunStore {
    base_dir: PathBuf,
}

impl LocalRunStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join(layout::RUNS_DIR)).await?;
        fs::create_dir_all(base_dir.join(layout::WORKERS_DIR)).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join(layout::RUNS_DIR)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn jobs_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(layout::JOBS_FILE)
    }

    fn metadata_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(layout::METADATA_FILE)
    }

    async fn copy_artifact(&self, run_id: &str, subdir: &str, file: &Path) -> StoreResult<String> {
        let target_dir = self.run_dir(run_id).join(subdir);
        fs::create_dir_all(&target_dir).await?;
        let target = target_dir.join(artifact_name(file)?);
        let same_file = match (fs::canonicalize(file).await, fs::canonicalize(&target).await) {
            (Ok(source), Ok(existing)) => source == existing,
            _ => false,
        };
        if !same_file {
            fs::copy(file, &target).await?;
        }
        Ok(target.display().to_string())
    }
}

#[async_trait]
impl RunStore for LocalRunStore {
    fn describe(&self) -> String {
        format!("local:{}", self.base_dir.display())
    }

    async fn list_run_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.runs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_run_id(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn load_jobs_versioned(
        &self,
        run_id: &str,
    ) -> StoreResult<(Vec<JobRecord>, LedgerVersion)> {
        match read_optional(&self.jobs_path(run_id)).await? {
            None => Ok((Vec::new(), LedgerVersion::missing())),
            Some(bytes) => {
                let jobs = serde_json::from_slice(&bytes)?;
                Ok((jobs, LedgerVersion::tag(sha256_hex(&bytes))))
            }
        }
    }

    async fn save_jobs(&self, run_id: &str, jobs: &[JobRecord]) -> StoreResult<()> {
        let path = self.jobs_path(run_id);
        let lock = LedgerLock::acquire(&path).await?;
        write_atomic(&path, &to_pretty_json(jobs)?).await?;
        lock.release().await
    }

    async fn save_jobs_if(
        &self,
        run_id: &str,
        jobs: &[JobRecord],
        expected: &LedgerVersion,
    ) -> StoreResult<bool> {
        let path = self.jobs_path(run_id);
        let lock = LedgerLock::acquire(&path).await?;

        let current = match read_optional(&path).await? {
            None => LedgerVersion::missing(),
            Some(bytes) => LedgerVersion::tag(sha256_hex(&bytes)),
        };
        if &current != expected {
            tracing::debug!(run_id, "Ledger changed since it was read");
            lock.release().await?;
            return Ok(false);
        }
        write_atomic(&path, &to_pretty_json(jobs)?).await?;
        lock.release().await?;
        Ok(true)
    }

    async fn load_metadata(&self, run_id: &str) -> StoreResult<Option<RunMetadata>> {
        match read_optional(&self.metadata_path(run_id)).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    async fn save_metadata(&self, run_id: &str, metadata: &RunMetadata) -> StoreResult<()> {
        write_atomic(&self.metadata_path(run_id), &to_pretty_json(metadata)?).await
    }

    async fn ensure_local_cache(&self, run_id: &str, _cache_root: &Path) -> StoreResult<PathBuf> {
        // Local workers read configs straight out of the run directory.
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir).await?;
        Ok(run_dir)
    }

    async fn upload_output(&self, run_id: &str, file: &Path) -> StoreResult<String> {
        self.copy_artifact(run_id, layout::OUTPUTS_DIR, file).await
    }

    async fn upload_thumbnail(&self, run_id: &str, file: &Path) -> StoreResult<String> {
        self.copy_artifact(run_id, layout::THUMBNAILS_DIR, file).await
    }

    async fn read_run_file(&self, run_id: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_file_name(name)?;
        read_optional(&self.run_dir(run_id).join(name)).await
    }

    async fn write_run_file(&self, run_id: &str, name: &str, contents: &[u8]) -> StoreResult<()> {
        validate_file_name(name)?;
        write_atomic(&self.run_dir(run_id).join(name), contents).await
    }

    async fn append_manifest_row(&self, run_id: &str, row: &ManifestRow) -> StoreResult<()> {
        let path = self.run_dir(run_id).join(layout::MANIFEST_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let needs_header = match fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        let bytes = encode_manifest_row(row, needs_header)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_run_state(&self) -> StoreResult<RunStateDocument> {
        let path = self.runs_dir().join(layout::STATE_FILE);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(RunStateDocument::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt run-state document, using defaults");
                Ok(RunStateDocument::default())
            }
        }
    }

    async fn save_run_state(&self, document: &RunStateDocument) -> StoreResult<()> {
        let path = self.runs_dir().join(layout::STATE_FILE);
        write_atomic(&path, &to_pretty_json(document)?).await
    }

    async fn read_counter(&self) -> StoreResult<Option<u64>> {
        let path = self.runs_dir().join(layout::COUNTER_FILE);
        Ok(read_optional(&path).await?.and_then(|bytes| parse_counter(&bytes)))
    }

    async fn write_counter(&self, value: u64) -> StoreResult<()> {
        let path = self.runs_dir().join(layout::COUNTER_FILE);
        write_atomic(&path, format!("{value}\n").as_bytes()).await
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Compute a SHA-256 hex digest of the given bytes.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Read a whole file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::NotFound(format!("parent directory of {}", path.display())))?;
    fs::create_dir_all(parent).await?;

    let file_name = artifact_name(path)?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Parse the run-id counter. Garbage reads as "no counter".
pub(crate) fn parse_counter(bytes: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    match text.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(contents = text, "Ignoring unreadable run counter");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger lock
// ---------------------------------------------------------------------------

/// Exclusive lock on one ledger, held for the duration of a write.
///
/// Released when dropped.
struct LedgerLock {
    path: PathBuf,
    released: bool,
}

impl LedgerLock {
    async fn acquire(ledger: &Path) -> StoreResult<Self> {
        if let Some(parent) = ledger.parent() {
            fs::create_dir_all(parent).await?;
        }
        let path = lock_path(ledger);
        let started = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let owner = format!("{} {}\n", std::process::id(), uuid::Uuid::new_v4().simple());
                    file.write_all(owner.as_bytes()).await?;
                    file.flush().await?;
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = stale_lock_owner(&path).await {
                        break_stale_lock(&path, &observed).await?;
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT_LIMIT {
                        return Err(StoreError::LockTimeout(path.display().to_string()));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for LedgerLock {
    /// Fallback for early returns; the happy path calls [`LedgerLock::release`].
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn lock_path(ledger: &Path) -> PathBuf {
    let mut name = ledger.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

/// Owner line of an abandoned lock, `None` if the lock is live or gone.
async fn stale_lock_owner(path: &Path) -> Option<String> {
    if !is_stale(path).await {
        return None;
    }
    fs::read_to_string(path).await.ok()
}

/// Remove an abandoned lock without clobbering one a competing waiter
/// acquired in the meantime.
///
/// The lock is first renamed aside, so only one waiter can take it. If the
/// file taken is not the abandoned one that was observed, it is linked back
/// into place.
async fn break_stale_lock(path: &Path, observed: &str) -> StoreResult<()> {
    let aside = path.with_extension(format!("lock.{}.stale", uuid::Uuid::new_v4().simple()));
    match fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let taken = fs::read_to_string(&aside).await.unwrap_or_default();
    if taken == observed && is_stale(&aside).await {
        tracing::warn!(lock = %path.display(), owner = %observed.trim(), "Removed abandoned ledger lock");
    } else if let Err(e) = fs::hard_link(&aside, path).await {
        tracing::warn!(lock = %path.display(), error = %e, "Could not restore a live ledger lock");
    }
    let _ = fs::remove_file(&aside).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
