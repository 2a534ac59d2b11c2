//! Invoking the external renderer.
//!
//! [`ProcessExecutor`] writes the job file, spawns
//! `<program> <args...> <job_file> <result_file>`, captures the child's
//! output and parses the result file the renderer leaves behind. The
//! renderer's own environment is never touched; config path overrides are
//! set on the child only. An optional wall-clock limit kills renders that
//! hang.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loom_core::executor::{
    ExecutorJobPayload, ExecutorReport, FABRICS_DIR_ENV, GARMENTS_DIR_ENV, RENDER_CONFIG_ENV,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Characters of stderr quoted in a failure message.
const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid executor report: {0}")]
    InvalidReport(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Executor timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}

/// One job handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub run_id: String,
    pub config: serde_json::Value,
    /// Directory holding the run's `configs/` tree.
    pub cache_root: PathBuf,
    /// Scratch directory for the job and result files.
    pub work_dir: PathBuf,
}

impl ExecutionRequest {
    pub fn job_file(&self) -> PathBuf {
        self.work_dir.join(format!("{}.json", self.job_id))
    }

    pub fn result_file(&self) -> PathBuf {
        self.work_dir.join(format!("{}.result.json", self.job_id))
    }

    /// Environment overrides pointing the renderer at this run's configs.
    pub fn env_overrides(&self) -> Vec<(&'static str, PathBuf)> {
        let configs = self.cache_root.join("configs");
        vec![
            (RENDER_CONFIG_ENV, configs.join("render_config.json")),
            (GARMENTS_DIR_ENV, configs.join("garments")),
            (FABRICS_DIR_ENV, configs.join("fabrics")),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub report: ExecutorReport,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    /// Only a successful report from a process that exited cleanly counts.
    pub fn succeeded(&self) -> bool {
        self.report.success && self.exit_code == 0
    }

    /// Human-readable reason for a failed outcome.
    pub fn error_text(&self) -> String {
        if let Some(error) = self.report.error.as_deref().filter(|e| !e.is_empty()) {
            return error.to_string();
        }
        let mut text = if self.exit_code != 0 {
            format!("Executor exited with code {}", self.exit_code)
        } else {
            "Executor reported failure".to_string()
        };
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
            let tail: String = stderr.chars().skip(skip).collect();
            text.push_str(": ");
            text.push_str(&tail);
        }
        text
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Runs the renderer as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// Kill the child once it has run for `limit`.
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        tokio::fs::create_dir_all(&request.work_dir).await?;
        let job_file = request.job_file();
        let result_file = request.result_file();

        let payload = ExecutorJobPayload::new(&request.job_id, &request.run_id, &request.config);
        let body = serde_json::to_vec_pretty(&payload)
            .map_err(|e| ExecutorError::InvalidReport(e.to_string()))?;
        tokio::fs::write(&job_file, body).await?;
        remove_if_present(&result_file).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&job_file)
            .arg(&result_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in request.env_overrides() {
            cmd.env(key, value);
        }

        tracing::debug!(
            program = %self.program,
            job_id = %request.job_id,
            job_file = %job_file.display(),
            "Spawning executor"
        );
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

        let status = match self.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    if let Err(e) = child.kill().await {
                        tracing::warn!(job_id = %request.job_id, error = %e, "Failed to kill timed-out executor");
                    }
                    tracing::warn!(
                        program = %self.program,
                        job_id = %request.job_id,
                        elapsed_ms,
                        "Executor timed out"
                    );
                    return Err(ExecutorError::Timeout { elapsed_ms });
                }
            },
            None => child.wait().await?,
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        let report = match tokio::fs::read(&result_file).await {
            Ok(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ExecutorError::InvalidReport(e.to_string()))?;
                ExecutorReport::from_value(value)
                    .map_err(|e| ExecutorError::InvalidReport(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExecutorReport::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(ExecutionOutcome {
            report,
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            duration_ms,
        })
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Read an output stream to EOF, keeping the first [`MAX_OUTPUT_BYTES`].
///
/// The remainder is drained so a chatty child never blocks or dies on a
/// closed pipe.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
