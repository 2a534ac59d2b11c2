//! Loom worker event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`WorkerEvent`]: the envelope for everything a worker reports about its
//!   own progress.
//! - [`spawn_event_logger`]: background task that writes each event as a
//!   structured log line.

pub mod bus;
pub mod logger;

pub use bus::{event_types, EventBus, WorkerEvent};
pub use logger::spawn_event_logger;
