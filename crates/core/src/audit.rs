//! Rows of the per-run audit log (`manifest.csv`).

use serde::{Deserialize, Serialize};

use crate::job::JobRecord;
use crate::types::Timestamp;

/// Column order of `manifest.csv`. Must match the field order of
/// [`ManifestRow`].
pub const MANIFEST_HEADERS: [&str; 9] = [
    "timestamp",
    "status",
    "garment",
    "fabric",
    "asset",
    "view",
    "output",
    "worker",
    "notes",
];

/// One append-only audit row. Missing values are written as empty cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub timestamp: String,
    pub status: String,
    #[serde(default)]
    pub garment: String,
    #[serde(default)]
    pub fabric: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub view: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub notes: String,
}

impl ManifestRow {
    /// Describe the current state of `job`, pulling the descriptive columns
    /// from its config and the output from its result.
    pub fn from_job(job: &JobRecord, at: Timestamp) -> Self {
        let field = |key: &str| config_string(&job.config, key);
        let output = job
            .result
            .as_ref()
            .and_then(|r| r.get("uploaded").or_else(|| r.get("output_path")))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Self {
            timestamp: at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            status: job.status.as_str().to_string(),
            garment: field("garment"),
            fabric: field("fabric"),
            asset: field("asset"),
            view: field("view"),
            output,
            worker: job.worker.clone().unwrap_or_default(),
            notes: job.notes.clone().unwrap_or_default(),
        }
    }
}

/// Render a config value as a cell: strings verbatim, scalars via JSON,
/// missing or null as empty.
fn config_string(config: &serde_json::Value, key: &str) -> String {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::job::{create_job_record, update_job_status, JobStatus};
    use crate::types::now;

    #[test]
    fn row_from_failed_job() {
        let mut job = create_job_record(
            "0001",
            1,
            json!({"garment": "shirt", "fabric": "denim", "view": "front", "asset": null}),
        );
        update_job_status(&mut job, JobStatus::Running, Some("w1"), None).expect("claim");
        update_job_status(&mut job, JobStatus::Failed, Some("w1"), Some(json!({"error": "boom"})))
            .expect("fail");
        job.notes = Some("boom".into());

        let row = ManifestRow::from_job(&job, now());

        assert_eq!(row.status, "failed");
        assert_eq!(row.garment, "shirt");
        assert_eq!(row.fabric, "denim");
        assert_eq!(row.asset, "");
        assert_eq!(row.output, "");
        assert_eq!(row.worker, "w1");
        assert_eq!(row.notes, "boom");
        assert!(row.timestamp.ends_with('Z'));
    }

    #[test]
    fn uploaded_reference_preferred_for_output() {
        let mut job = create_job_record("0001", 1, json!({}));
        update_job_status(&mut job, JobStatus::Running, Some("w1"), None).expect("claim");
        update_job_status(
            &mut job,
            JobStatus::Completed,
            Some("w1"),
            Some(json!({"output_path": "/tmp/a.png", "uploaded": "s3://b/runs/0001/outputs/a.png"})),
        )
        .expect("complete");

        let row = ManifestRow::from_job(&job, now());
        assert_eq!(row.output, "s3://b/runs/0001/outputs/a.png");
    }
}
