//! Run creation, run-id allocation and run-level bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;

use loom_core::audit::ManifestRow;
use loom_core::job::{expand_configs_to_jobs, JobRecord};
use loom_core::run::{format_run_id, normalize_set, parse_run_number, RunCounts, RunMetadata, RunStatus};
use loom_core::types::now;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreResult;
use crate::layout::{self, manifest_header, to_pretty_json};
use crate::local::parse_counter;
use crate::run_state::RunStateManifest;
use crate::run_store::RunStore;

/// Environment variable that overrides the recorded run author.
pub const RUN_USER_ENV: &str = "LOOM_RUN_USER";

/// Everything a caller supplies when submitting a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub note: String,
    pub mode: Option<String>,
    pub garment: Option<String>,
    pub fabrics: Vec<String>,
    pub assets: Vec<String>,
    pub views: Vec<String>,
    /// One opaque render config per job, in execution order.
    pub configs: Vec<Value>,
    pub extra: Option<Value>,
    /// Initial scheduling priority. `None` leaves the run on the default.
    pub priority: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub run_id: String,
    pub metadata: RunMetadata,
    pub jobs: Vec<JobRecord>,
}

pub struct RunManager {
    store: Arc<dyn RunStore>,
    run_state: Arc<RunStateManifest>,
    host_counter: Option<PathBuf>,
    allocation: Mutex<()>,
}

impl RunManager {
    pub fn new(store: Arc<dyn RunStore>, run_state: Arc<RunStateManifest>) -> Self {
        Self {
            store,
            run_state,
            host_counter: None,
            allocation: Mutex::new(()),
        }
    }

    /// Also track allocations in a counter file private to this host.
    pub fn with_host_counter(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_counter = Some(path.into());
        self
    }

    /// Allocate the next run id.
    ///
    /// The next number is one past the highest of the shared counter, the
    /// host counter (if configured) and the highest existing run id, so a
    /// lost or stale counter never causes reuse. The result is written back
    /// to every counter in use.
    pub async fn allocate_run_id(&self) -> StoreResult<String> {
        let _guard = self.allocation.lock().await;

        let shared = self.store.read_counter().await?.unwrap_or(0);
        let host = match &self.host_counter {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => parse_counter(&bytes).unwrap_or(0),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            },
            None => 0,
        };
        let scanned = self
            .store
            .list_run_ids()
            .await?
            .iter()
            .filter_map(|id| parse_run_number(id).ok())
            .max()
            .unwrap_or(0);

        let next = shared.max(host).max(scanned) + 1;
        self.store.write_counter(next).await?;
        if let Some(path) = &self.host_counter {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, format!("{next}\n")).await?;
        }

        let run_id = format_run_id(next);
        tracing::debug!(run_id = %run_id, shared, host, scanned, "Allocated run id");
        Ok(run_id)
    }

    /// Allocate an id and write every file of a fresh run.
    pub async fn create_run(&self, new_run: NewRun) -> StoreResult<CreatedRun> {
        let run_id = self.allocate_run_id().await?;
        let jobs = expand_configs_to_jobs(&run_id, new_run.configs.iter().cloned());
        let created_at = now();

        let mut metadata = RunMetadata {
            run_id: run_id.clone(),
            created_at: Some(created_at),
            created_by: Some(run_author()),
            host: host_name(),
            git_commit: git_commit().await,
            note: new_run.note.trim().to_string(),
            mode: new_run.mode,
            garment: new_run.garment,
            fabrics: normalize_set(new_run.fabrics),
            assets: normalize_set(new_run.assets),
            views: normalize_set(new_run.views),
            status: RunStatus::Pending,
            extra: new_run.extra,
            ..RunMetadata::empty(&run_id)
        };
        RunCounts::from_jobs(&jobs).apply_to(&mut metadata, created_at);

        self.store.save_jobs(&run_id, &jobs).await?;
        self.store.save_metadata(&run_id, &metadata).await?;
        self.store
            .write_run_file(&run_id, layout::NOTES_FILE, notes_markdown(&run_id, &metadata.note).as_bytes())
            .await?;
        let plan: Vec<Value> = new_run.configs.iter().map(plan_entry).collect();
        self.store
            .write_run_file(&run_id, layout::PLAN_FILE, &to_pretty_json(&plan)?)
            .await?;
        if self
            .store
            .read_run_file(&run_id, layout::MANIFEST_FILE)
            .await?
            .is_none()
        {
            self.store
                .write_run_file(&run_id, layout::MANIFEST_FILE, &manifest_header()?)
                .await?;
        }
        if let Some(priority) = new_run.priority {
            self.run_state.set_run_priority(&run_id, priority).await?;
        }

        tracing::info!(
            run_id = %run_id,
            jobs = jobs.len(),
            store = %self.store.describe(),
            "Run created"
        );
        Ok(CreatedRun {
            run_id,
            metadata,
            jobs,
        })
    }

    /// Append one audit row to the run's `manifest.csv`.
    pub async fn append_manifest_entry(&self, run_id: &str, row: &ManifestRow) -> StoreResult<()> {
        self.store.append_manifest_row(run_id, row).await
    }

    /// Current metadata, or a minimal record when `run.json` is missing.
    pub async fn summarize_run(&self, run_id: &str) -> StoreResult<RunMetadata> {
        Ok(self
            .store
            .load_metadata(run_id)
            .await?
            .unwrap_or_else(|| RunMetadata::empty(run_id)))
    }

    /// Merge `updates` into the run's metadata, key by key.
    pub async fn update_run_metadata(
        &self,
        run_id: &str,
        updates: serde_json::Map<String, Value>,
    ) -> StoreResult<RunMetadata> {
        let current = self.summarize_run(run_id).await?;
        let mut merged = match serde_json::to_value(current)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        merged.extend(updates);
        merged.insert("run_id".to_string(), Value::String(run_id.to_string()));
        let metadata: RunMetadata = serde_json::from_value(Value::Object(merged))?;
        self.store.save_metadata(run_id, &metadata).await?;
        Ok(metadata)
    }

    /// Recount the full ledger and overwrite every derived metadata field.
    pub async fn recompute_run_metadata(&self, run_id: &str) -> StoreResult<RunMetadata> {
        let jobs = self.store.load_jobs(run_id).await?;
        let mut metadata = self.summarize_run(run_id).await?;
        RunCounts::from_jobs(&jobs).apply_to(&mut metadata, now());
        self.store.save_metadata(run_id, &metadata).await?;
        Ok(metadata)
    }
}

// ---------------------------------------------------------------------------
// Provenance and file bodies
// ---------------------------------------------------------------------------

fn run_author() -> String {
    [RUN_USER_ENV, "USER", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn host_name() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

async fn git_commit() -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!commit.is_empty()).then_some(commit)
}

fn notes_markdown(run_id: &str, note: &str) -> String {
    let body = if note.is_empty() {
        "(no notes provided)"
    } else {
        note
    };
    format!("# Run {run_id}\n\n{body}\n")
}

/// Plan entries keep scalar values and stringify everything else.
fn plan_entry(config: &Value) -> Value {
    match config {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let safe = match value {
                        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                        scalar => scalar.clone(),
                    };
                    (key.clone(), safe)
                })
                .collect(),
        ),
        Value::Array(_) => Value::String(config.to_string()),
        scalar => scalar.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn notes_fall_back_to_placeholder() {
        assert_eq!(notes_markdown("0004", ""), "# Run 0004\n\n(no notes provided)\n");
        assert_eq!(notes_markdown("0004", "denim test"), "# Run 0004\n\ndenim test\n");
    }

    #[test]
    fn plan_entries_stringify_nested_values() {
        let entry = plan_entry(&json!({
            "garment": "shirt",
            "scale": 1.5,
            "debug": true,
            "asset": null,
            "views": ["front", "back"]
        }));
        assert_eq!(entry["garment"], "shirt");
        assert_eq!(entry["scale"], 1.5);
        assert_eq!(entry["debug"], true);
        assert!(entry["asset"].is_null());
        assert_eq!(entry["views"], "[\"front\",\"back\"]");
    }

    #[test]
    fn author_never_empty() {
        assert!(!run_author().is_empty());
    }
}
