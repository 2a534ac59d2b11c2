//! Wire contract between a worker and the external renderer process.
//!
//! The worker writes an [`ExecutorJobPayload`] to a job file, the renderer
//! writes an [`ExecutorReport`] to a result file. Both are JSON.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The only command the worker ever asks the renderer to run.
pub const RENDER_COMMAND: &str = "render_with_config";

/// Environment variable pointing the renderer at the run's cached render config.
pub const RENDER_CONFIG_ENV: &str = "LOOM_RENDER_CONFIG";
/// Environment variable pointing the renderer at the run's cached garment configs.
pub const GARMENTS_DIR_ENV: &str = "LOOM_GARMENTS_DIR";
/// Environment variable pointing the renderer at the run's cached fabric configs.
pub const FABRICS_DIR_ENV: &str = "LOOM_FABRICS_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderArgs {
    pub mode: Option<serde_json::Value>,
    pub garment: Option<serde_json::Value>,
    pub fabric: Option<serde_json::Value>,
    pub asset: Option<serde_json::Value>,
    pub view: Option<serde_json::Value>,
    pub save_debug_files: serde_json::Value,
}

impl RenderArgs {
    /// Pick the renderer arguments out of an opaque job config.
    /// `save_debug_files` defaults to `true`.
    pub fn from_config(config: &serde_json::Value) -> Self {
        let pick = |key: &str| config.get(key).filter(|v| !v.is_null()).cloned();
        Self {
            mode: pick("mode"),
            garment: pick("garment"),
            fabric: pick("fabric"),
            asset: pick("asset"),
            view: pick("view"),
            save_debug_files: pick("save_debug_files").unwrap_or(serde_json::Value::Bool(true)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderCommand {
    pub command: String,
    pub args: RenderArgs,
}

/// Contents of the job file handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorJobPayload {
    pub job_id: String,
    pub run_id: String,
    pub config: RenderCommand,
}

impl ExecutorJobPayload {
    pub fn new(job_id: &str, run_id: &str, config: &serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            config: RenderCommand {
                command: RENDER_COMMAND.to_string(),
                args: RenderArgs::from_config(config),
            },
        }
    }
}

/// Contents of the result file written by the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorReport {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutorReport {
    /// Parse a result document, unwrapping the legacy `{"result": {...}}`
    /// envelope when the top level carries no `success` flag.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        let inner = match value {
            serde_json::Value::Object(ref map) if !map.contains_key("success") => {
                match map.get("result") {
                    Some(wrapped @ serde_json::Value::Object(_)) => wrapped.clone(),
                    _ => value,
                }
            }
            serde_json::Value::Object(_) => value,
            other => {
                return Err(CoreError::Validation(format!(
                    "Executor report must be a JSON object, got {other}"
                )))
            }
        };
        serde_json::from_value(inner)
            .map_err(|e| CoreError::Validation(format!("Malformed executor report: {e}")))
    }

    /// Path of the rendered artifact: `result.output_path` when `result` is
    /// an object, or `result` itself when it is a string.
    pub fn output_path(&self) -> Option<&str> {
        match self.result.as_ref()? {
            serde_json::Value::String(path) => Some(path.as_str()),
            serde_json::Value::Object(map) => map.get("output_path").and_then(|v| v.as_str()),
            _ => None,
        }
        .filter(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
