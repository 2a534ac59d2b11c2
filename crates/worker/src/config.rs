//! Command-line and environment configuration.
//!
//! Every option is a flag with an environment fallback, so a `.env` file
//! loaded by `dotenvy` configures a worker the same way flags do.
//!
//! | Flag                   | Env                       | Default                   |
//! |------------------------|---------------------------|---------------------------|
//! | `--store`              | `LOOM_RUN_STORE`          | `./data`                  |
//! | `--worker-store`       | `LOOM_WORKER_STORE`       | same as `--store`         |
//! | `--poll-interval-secs` | `LOOM_POLL_INTERVAL_SECS` | `15`                      |
//! | `--worker-id`          | `LOOM_WORKER_ID`          | hostname                  |
//! | `--mode`               | `LOOM_NODE_MODE`          | `client`                  |
//! | `--run`                | `LOOM_PREFERRED_RUN`      | none                      |
//! | `--executor`           | `LOOM_EXECUTOR`           | `blender`                 |
//! | `--cache-dir`          | `LOOM_CACHE_DIR`          | `<tmp>/loom-worker-cache` |

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_STORE: &str = "./data";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MODE: &str = "client";
pub const DEFAULT_EXECUTOR: &str = "blender";

#[derive(Debug, Parser)]
#[command(name = "loom-worker", version, about = "Render farm worker and run administration")]
pub struct Cli {
    /// Run store: `s3://bucket/prefix` or a local base directory.
    #[arg(long, env = "LOOM_RUN_STORE", default_value = DEFAULT_STORE, global = true)]
    pub store: String,

    /// Heartbeat registry location. Defaults to the run store.
    #[arg(long, env = "LOOM_WORKER_STORE", global = true)]
    pub worker_store: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn worker_store(&self) -> &str {
        self.worker_store.as_deref().unwrap_or(&self.store)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll for pending jobs and render them.
    Work(WorkArgs),
    /// Create a run from a JSON array of render configs.
    Submit(SubmitArgs),
    /// List runs with their aggregate status.
    Runs,
    /// List worker heartbeats with liveness.
    Workers,
    /// Stop workers from picking up jobs of a run.
    Pause { run_id: String },
    /// Make a paused run schedulable again.
    Resume { run_id: String },
    /// Set a run's scheduling priority (lower runs first).
    Priority { run_id: String, priority: i64 },
    /// Report running jobs whose worker looks gone.
    Orphans,
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    #[arg(long, env = "LOOM_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "LOOM_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "LOOM_NODE_MODE", default_value = DEFAULT_MODE)]
    pub mode: String,

    /// Scan this run before any other.
    #[arg(long = "run", env = "LOOM_PREFERRED_RUN")]
    pub preferred_run: Option<String>,

    /// Process at most one job, then exit.
    #[arg(long)]
    pub once: bool,

    #[arg(long, env = "LOOM_EXECUTOR", default_value = DEFAULT_EXECUTOR)]
    pub executor: String,

    /// Leading argument passed to the executor; repeatable.
    #[arg(long = "executor-arg", allow_hyphen_values = true)]
    pub executor_args: Vec<String>,

    #[arg(long, env = "LOOM_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Kill a render after this many seconds; unset or 0 means no limit.
    #[arg(long, env = "LOOM_EXECUTOR_TIMEOUT_SECS")]
    pub executor_timeout_secs: Option<u64>,
}

impl WorkArgs {
    pub fn executor_timeout(&self) -> Option<Duration> {
        self.executor_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// JSON file holding an array of render configs.
    pub configs: PathBuf,

    #[arg(long, default_value = "")]
    pub note: String,

    #[arg(long)]
    pub mode: Option<String>,

    #[arg(long)]
    pub garment: Option<String>,

    #[arg(long = "fabric")]
    pub fabrics: Vec<String>,

    #[arg(long = "asset")]
    pub assets: Vec<String>,

    #[arg(long = "view")]
    pub views: Vec<String>,

    #[arg(long)]
    pub priority: Option<i64>,

    /// Host-local counter file that also feeds run-id allocation.
    #[arg(long, env = "LOOM_HOST_COUNTER")]
    pub host_counter: Option<PathBuf>,
}

/// Settings the coordinator loop runs with.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub mode: String,
    pub poll_interval: Duration,
    pub preferred_run: Option<String>,
    pub once: bool,
    /// Private scratch: run config caches and executor job/result files.
    pub cache_dir: PathBuf,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_id: worker_id.into(),
            mode: DEFAULT_MODE.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            preferred_run: None,
            once: false,
            cache_dir: cache_dir.into(),
        }
    }

    /// Where run configs are materialized.
    pub fn runs_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("runs")
    }

    /// Where executor job and result files are written.
    pub fn work_dir(&self) -> PathBuf {
        self.cache_dir.join("work")
    }
}

impl From<&WorkArgs> for WorkerConfig {
    fn from(args: &WorkArgs) -> Self {
        let worker_id = args
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(local_hostname);
        let cache_dir = args
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("loom-worker-cache"));
        Self {
            worker_id,
            mode: args.mode.clone(),
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            preferred_run: args.preferred_run.clone().filter(|r| !r.is_empty()),
            once: args.once,
            cache_dir,
        }
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
