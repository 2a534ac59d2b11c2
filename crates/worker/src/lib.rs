//! The loom render worker.
//!
//! A worker polls the shared run store, claims one pending job at a time,
//! hands it to an external [`executor::Executor`] and reports the outcome
//! back into the ledger, the run metadata and the audit manifest.

pub mod claim;
pub mod config;
pub mod executor;
pub mod runner;
pub mod thumbnail;

pub use config::WorkerConfig;
pub use executor::{ExecutionOutcome, ExecutionRequest, Executor, ExecutorError, ProcessExecutor};
pub use runner::{RunnerError, WorkerRunner};
