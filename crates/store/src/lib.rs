//! Durable storage for the Loom render farm.
//!
//! - [`RunStore`]: run ledgers, metadata, artifacts and shared control
//!   files, with a local-disk and an S3 backend.
//! - [`WorkerRegistry`]: per-worker heartbeat snapshots.
//! - [`RunStateManifest`]: priority/pause controls across runs.
//! - [`RunManager`]: run-id allocation and run creation.

pub mod error;
pub mod layout;
pub mod local;
pub mod registry;
pub mod run_manager;
pub mod run_state;
pub mod run_store;
pub mod s3;

pub use error::{StoreError, StoreResult};
pub use local::LocalRunStore;
pub use registry::{open_worker_registry, WorkerRegistry};
pub use run_manager::{NewRun, RunManager};
pub use run_state::RunStateManifest;
pub use run_store::{open_run_store, LedgerVersion, RunStore};
pub use s3::{S3Location, S3RunStore};
