//! Background subscriber that mirrors bus traffic into `tracing`.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::{event_types, WorkerEvent};

/// Spawn a task that logs every event received on `receiver`.
///
/// Failure events log at `warn`, everything else at `info`. The task exits
/// when the bus is dropped.
pub fn spawn_event_logger(mut receiver: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged, some events were not logged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &WorkerEvent) {
    let run_id = event.run_id.as_deref().unwrap_or("");
    let job_id = event.job_id.as_deref().unwrap_or("");
    match event.event_type.as_str() {
        event_types::JOB_FAILED | event_types::JOB_ERROR => tracing::warn!(
            event = %event.event_type,
            worker_id = %event.worker_id,
            run_id,
            job_id,
            payload = %event.payload,
            "Worker event"
        ),
        _ => tracing::info!(
            event = %event.event_type,
            worker_id = %event.worker_id,
            run_id,
            job_id,
            payload = %event.payload,
            "Worker event"
        ),
    }
}
