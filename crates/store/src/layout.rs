//! Relative layout shared by every backend, plus the on-disk encodings.
//!
//! ```text
//! runs/<run_id>/{run.json, jobs.json, notes.md, manifest.csv, plan.json,
//!                outputs/, thumbnails/, configs/}
//! runs/state.json
//! runs/.counter
//! workers/<worker_id>.json
//! ```

use std::path::Path;

use loom_core::audit::{ManifestRow, MANIFEST_HEADERS};
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

pub const RUNS_DIR: &str = "runs";
pub const WORKERS_DIR: &str = "workers";

pub const JOBS_FILE: &str = "jobs.json";
pub const METADATA_FILE: &str = "run.json";
pub const NOTES_FILE: &str = "notes.md";
pub const MANIFEST_FILE: &str = "manifest.csv";
pub const PLAN_FILE: &str = "plan.json";

pub const OUTPUTS_DIR: &str = "outputs";
pub const THUMBNAILS_DIR: &str = "thumbnails";
pub const CONFIGS_DIR: &str = "configs";

pub const STATE_FILE: &str = "state.json";
pub const COUNTER_FILE: &str = ".counter";

/// Pretty-printed JSON with a trailing newline.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encode one manifest row, optionally preceded by the header line.
pub fn encode_manifest_row(row: &ManifestRow, with_header: bool) -> StoreResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(MANIFEST_HEADERS)?;
    }
    writer.serialize(row)?;
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))
}

/// The header line alone, written when a run is created.
pub fn manifest_header() -> StoreResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(MANIFEST_HEADERS)?;
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))
}

/// Auxiliary run files are addressed by bare name only.
pub fn validate_file_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StoreError::Core(loom_core::error::CoreError::Validation(
            format!("'{name}' is not a plain file name"),
        )));
    }
    Ok(())
}

/// File name component of an artifact path.
pub fn artifact_name(path: &Path) -> StoreResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::NotFound(format!("file name of {}", path.display())))
}

/// MIME type used when uploading an artifact.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("exr") => "image/x-exr",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("md") => "text/markdown",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
