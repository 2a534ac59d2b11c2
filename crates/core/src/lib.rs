//! Domain model for the Loom render farm.
//!
//! Everything here is pure data and rules; persistence lives in `loom-store`
//! and process orchestration in `loom-worker`.

pub mod audit;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod job;
pub mod run;
pub mod run_state;
pub mod types;
