//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`WorkerEvent`]s. It is
//! shared via `Arc<EventBus>` between the runner and whatever observes it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use loom_core::types::{now, Timestamp};

/// Event names emitted by the worker runner.
pub mod event_types {
    pub const STARTED: &str = "started";
    pub const IDLE: &str = "idle";
    pub const JOB_CLAIMED: &str = "job-claimed";
    pub const JOB_COMPLETED: &str = "job-completed";
    pub const JOB_FAILED: &str = "job-failed";
    pub const JOB_ERROR: &str = "job-error";
    pub const STOPPED: &str = "stopped";
}

// ---------------------------------------------------------------------------
// WorkerEvent
// ---------------------------------------------------------------------------

/// Something a worker did or observed.
///
/// Constructed via [`WorkerEvent::new`] and enriched with
/// [`with_run`](WorkerEvent::with_run), [`with_job`](WorkerEvent::with_job)
/// and [`with_payload`](WorkerEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// One of the names in [`event_types`].
    pub event_type: String,

    pub worker_id: String,

    pub run_id: Option<String>,

    pub job_id: Option<String>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    pub timestamp: Timestamp,
}

impl WorkerEvent {
    pub fn new(event_type: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            worker_id: worker_id.into(),
            run_id: None,
            job_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: now(),
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Attach both the job and the run it belongs to.
    pub fn with_job(mut self, run_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use loom_events::bus::{event_types, EventBus, WorkerEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(WorkerEvent::new(event_types::STARTED, "render-01"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are dropped
    /// and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. With no subscribers the
    /// event is dropped.
    pub fn publish(&self, event: WorkerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            WorkerEvent::new(event_types::JOB_FAILED, "w1")
                .with_job("0003", "0003-0001-deadbeef")
                .with_payload(serde_json::json!({"error": "exit code 1"})),
        );

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, "job-failed");
        assert_eq!(received.worker_id, "w1");
        assert_eq!(received.run_id.as_deref(), Some("0003"));
        assert_eq!(received.job_id.as_deref(), Some("0003-0001-deadbeef"));
        assert_eq!(received.payload["error"], "exit code 1");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(WorkerEvent::new(event_types::IDLE, "w1"));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.event_type, "idle");
        assert_eq!(e2.event_type, "idle");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(WorkerEvent::new(event_types::STOPPED, "w1"));
    }

    #[test]
    fn bare_event_has_empty_optional_fields() {
        let event = WorkerEvent::new(event_types::STARTED, "w1").with_run("0001");
        assert_eq!(event.run_id.as_deref(), Some("0001"));
        assert!(event.job_id.is_none());
        assert!(event.payload.is_object());
    }
}
