//! S3 backend.
//!
//! Keys mirror the local layout under an optional prefix:
//! `<prefix>/runs/<run_id>/...`, `<prefix>/workers/<worker_id>.json`.
//! Ledger versions are object ETags. Conditional writes send `If-Match`
//! (or `If-None-Match: *` for a ledger that did not exist yet) and treat
//! HTTP 412/409 as "someone else wrote first".

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use loom_core::audit::ManifestRow;
use loom_core::job::JobRecord;
use loom_core::run::{is_run_id, RunMetadata};
use loom_core::run_state::RunStateDocument;

use crate::error::{StoreError, StoreResult};
use crate::layout::{
    self, artifact_name, content_type_for, encode_manifest_row, to_pretty_json, validate_file_name,
};
use crate::local::parse_counter;
use crate::run_store::{LedgerVersion, RunStore};

/// Attempts at the read-append-write cycle for `manifest.csv`.
const MANIFEST_APPEND_ATTEMPTS: usize = 5;

/// Build a client from the default AWS provider chain.
pub async fn default_client() -> Client {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    Client::new(&config)
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// A parsed `s3://bucket[/prefix]` store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    /// Key prefix without leading or trailing slashes. May be empty.
    pub prefix: String,
}

impl S3Location {
    pub fn parse(uri: &str) -> StoreResult<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| StoreError::InvalidUri(format!("expected s3://bucket[/prefix], got '{uri}'")))?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StoreError::InvalidUri(format!("missing bucket in '{uri}'")));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Join `relative` onto the prefix.
    pub fn key(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.prefix)
        }
    }

    pub fn runs_prefix(&self) -> String {
        self.key(layout::RUNS_DIR)
    }

    pub fn run_key(&self, run_id: &str, name: &str) -> String {
        format!("{}/{run_id}/{name}", self.runs_prefix())
    }

    pub fn worker_key(&self, worker_id: &str) -> String {
        format!("{}/{worker_id}.json", self.key(layout::WORKERS_DIR))
    }

    pub fn uri_for(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

/// Extract the run id from a listing common prefix such as
/// `data/runs/0007/`. Non-run entries yield `None`.
pub fn run_id_from_common_prefix(runs_prefix: &str, common_prefix: &str) -> Option<String> {
    let rest = common_prefix.strip_prefix(runs_prefix)?.strip_prefix('/')?;
    let run_id = rest.trim_end_matches('/');
    (is_run_id(run_id) && !run_id.contains('/')).then(|| run_id.to_string())
}

/// 412 Precondition Failed and 409 Conflict both mean a conditional write lost.
pub fn is_conflict_status(status: u16) -> bool {
    status == 412 || status == 409
}

fn is_conflict<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|resp| is_conflict_status(resp.status().as_u16()))
}

/// Relative path of a downloaded key, refusing anything that would escape
/// the cache directory.
fn safe_relative(relative: &str) -> Option<PathBuf> {
    let path = PathBuf::from(relative);
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(path)
}

// ---------------------------------------------------------------------------
// Object helpers
// ---------------------------------------------------------------------------

/// Whole-object operations on one bucket, shared by the run store and the
/// worker registry.
#[derive(Clone)]
pub(crate) struct S3Objects {
    client: Client,
    bucket: String,
}

impl S3Objects {
    pub(crate) fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Fails unless the bucket exists and the credentials may use it.
    pub(crate) async fn check_bucket(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StoreError::s3("HeadBucket", e))?;
        Ok(())
    }

    /// Object bytes and ETag, or `None` when the key does not exist.
    pub(crate) async fn get(&self, key: &str) -> StoreResult<Option<(Vec<u8>, Option<String>)>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(StoreError::s3("GetObject", err));
            }
        };
        let etag = response.e_tag().map(str::to_string);
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::s3("GetObject body", e))?
            .into_bytes()
            .to_vec();
        Ok(Some((bytes, etag)))
    }

    pub(crate) async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StoreError::s3("PutObject", e))?;
        Ok(())
    }

    /// Put only if the object is still at `expected`. `Ok(false)` on conflict.
    pub(crate) async fn put_if(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        expected: &LedgerVersion,
    ) -> StoreResult<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes));
        request = match expected.as_tag() {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };
        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(&err) => Ok(false),
            Err(err) => Err(StoreError::s3("PutObject", err)),
        }
    }

    pub(crate) async fn upload_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| StoreError::s3("read upload body", e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(file))
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::s3("PutObject", e))?;
        Ok(())
    }

    /// Every key under `prefix`, following continuation tokens.
    pub(crate) async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StoreError::s3("ListObjectsV2", e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key()).map(str::to_string));
        }
        Ok(keys)
    }

    /// Immediate "subdirectories" of `prefix` (which must end in `/`).
    pub(crate) async fn list_common_prefixes(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StoreError::s3("ListObjectsV2", e))?;
            prefixes.extend(
                page.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(str::to_string),
            );
        }
        Ok(prefixes)
    }
}

// ---------------------------------------------------------------------------
// S3RunStore
// ---------------------------------------------------------------------------

pub struct S3RunStore {
    objects: S3Objects,
    location: S3Location,
}

impl S3RunStore {
    pub fn new(client: Client, location: S3Location) -> Self {
        Self {
            objects: S3Objects::new(client, location.bucket.clone()),
            location,
        }
    }

    pub fn location(&self) -> &S3Location {
        &self.location
    }

    /// Contact the bucket once so a bad configuration fails at startup
    /// instead of on every poll.
    pub async fn check_access(&self) -> StoreResult<()> {
        self.objects.check_bucket().await
    }

    async fn upload_into(&self, run_id: &str, subdir: &str, file: &Path) -> StoreResult<String> {
        let key = self
            .location
            .run_key(run_id, &format!("{subdir}/{}", artifact_name(file)?));
        self.objects.upload_file(&key, file).await?;
        Ok(self.location.uri_for(&key))
    }
}

#[async_trait]
impl RunStore for S3RunStore {
    fn describe(&self) -> String {
        self.location.uri_for(&self.location.runs_prefix())
    }

    async fn list_run_ids(&self) -> StoreResult<Vec<String>> {
        let runs_prefix = self.location.runs_prefix();
        let mut ids: Vec<String> = self
            .objects
            .list_common_prefixes(&format!("{runs_prefix}/"))
            .await?
            .iter()
            .filter_map(|p| run_id_from_common_prefix(&runs_prefix, p))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn load_jobs_versioned(
        &self,
        run_id: &str,
    ) -> StoreResult<(Vec<JobRecord>, LedgerVersion)> {
        let key = self.location.run_key(run_id, layout::JOBS_FILE);
        match self.objects.get(&key).await? {
            None => Ok((Vec::new(), LedgerVersion::missing())),
            Some((bytes, etag)) => {
                let jobs = serde_json::from_slice(&bytes)?;
                let version = match etag {
                    Some(etag) => LedgerVersion::tag(etag),
                    None => LedgerVersion::tag(crate::local::sha256_hex(&bytes)),
                };
                Ok((jobs, version))
            }
        }
    }

    async fn save_jobs(&self, run_id: &str, jobs: &[JobRecord]) -> StoreResult<()> {
        let key = self.location.run_key(run_id, layout::JOBS_FILE);
        self.objects
            .put(&key, to_pretty_json(jobs)?, "application/json")
            .await
    }

    async fn save_jobs_if(
        &self,
        run_id: &str,
        jobs: &[JobRecord],
        expected: &LedgerVersion,
    ) -> StoreResult<bool> {
        let key = self.location.run_key(run_id, layout::JOBS_FILE);
        self.objects
            .put_if(&key, to_pretty_json(jobs)?, "application/json", expected)
            .await
    }

    async fn load_metadata(&self, run_id: &str) -> StoreResult<Option<RunMetadata>> {
        let key = self.location.run_key(run_id, layout::METADATA_FILE);
        match self.objects.get(&key).await? {
            None => Ok(None),
            Some((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    async fn save_metadata(&self, run_id: &str, metadata: &RunMetadata) -> StoreResult<()> {
        let key = self.location.run_key(run_id, layout::METADATA_FILE);
        self.objects
            .put(&key, to_pretty_json(metadata)?, "application/json")
            .await
    }

    async fn ensure_local_cache(&self, run_id: &str, cache_root: &Path) -> StoreResult<PathBuf> {
        let run_cache = cache_root.join(run_id);
        tokio::fs::create_dir_all(&run_cache).await?;

        let run_prefix = format!("{}/{run_id}/", self.location.runs_prefix());
        let configs_prefix = format!("{run_prefix}{}/", layout::CONFIGS_DIR);
        let keys = self.objects.list_keys(&configs_prefix).await?;
        let mut downloaded = 0usize;

        for key in keys {
            if key.ends_with('/') {
                continue;
            }
            let Some(relative) = key.strip_prefix(&run_prefix).and_then(safe_relative) else {
                tracing::warn!(key = %key, "Skipping config key outside the run cache");
                continue;
            };
            let Some((bytes, _)) = self.objects.get(&key).await? else {
                continue;
            };
            let target = run_cache.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
            downloaded += 1;
        }

        tracing::debug!(run_id, files = downloaded, cache = %run_cache.display(), "Run configs cached");
        Ok(run_cache)
    }

    async fn upload_output(&self, run_id: &str, file: &Path) -> StoreResult<String> {
        self.upload_into(run_id, layout::OUTPUTS_DIR, file).await
    }

    async fn upload_thumbnail(&self, run_id: &str, file: &Path) -> StoreResult<String> {
        self.upload_into(run_id, layout::THUMBNAILS_DIR, file).await
    }

    async fn read_run_file(&self, run_id: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_file_name(name)?;
        let key = self.location.run_key(run_id, name);
        Ok(self.objects.get(&key).await?.map(|(bytes, _)| bytes))
    }

    async fn write_run_file(&self, run_id: &str, name: &str, contents: &[u8]) -> StoreResult<()> {
        validate_file_name(name)?;
        let key = self.location.run_key(run_id, name);
        self.objects
            .put(&key, contents.to_vec(), content_type_for(Path::new(name)))
            .await
    }

    async fn append_manifest_row(&self, run_id: &str, row: &ManifestRow) -> StoreResult<()> {
        let key = self.location.run_key(run_id, layout::MANIFEST_FILE);
        for _ in 0..MANIFEST_APPEND_ATTEMPTS {
            let (mut bytes, version) = match self.objects.get(&key).await? {
                Some((bytes, Some(etag))) => (bytes, LedgerVersion::tag(etag)),
                Some((bytes, None)) => {
                    let version = LedgerVersion::tag(crate::local::sha256_hex(&bytes));
                    (bytes, version)
                }
                None => (Vec::new(), LedgerVersion::missing()),
            };
            bytes.extend(encode_manifest_row(row, bytes.is_empty())?);
            if self.objects.put_if(&key, bytes, "text/csv", &version).await? {
                return Ok(());
            }
            tracing::debug!(run_id, "Manifest changed during append, retrying");
        }
        Err(StoreError::LockTimeout(self.location.uri_for(&key)))
    }

    async fn load_run_state(&self) -> StoreResult<RunStateDocument> {
        let key = format!("{}/{}", self.location.runs_prefix(), layout::STATE_FILE);
        let Some((bytes, _)) = self.objects.get(&key).await? else {
            return Ok(RunStateDocument::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Corrupt run-state document, using defaults");
                Ok(RunStateDocument::default())
            }
        }
    }

    async fn save_run_state(&self, document: &RunStateDocument) -> StoreResult<()> {
        let key = format!("{}/{}", self.location.runs_prefix(), layout::STATE_FILE);
        self.objects
            .put(&key, to_pretty_json(document)?, "application/json")
            .await
    }

    async fn read_counter(&self) -> StoreResult<Option<u64>> {
        let key = format!("{}/{}", self.location.runs_prefix(), layout::COUNTER_FILE);
        Ok(self
            .objects
            .get(&key)
            .await?
            .and_then(|(bytes, _)| parse_counter(&bytes)))
    }

    async fn write_counter(&self, value: u64) -> StoreResult<()> {
        let key = format!("{}/{}", self.location.runs_prefix(), layout::COUNTER_FILE);
        self.objects
            .put(&key, format!("{value}\n").into_bytes(), "text/plain")
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
