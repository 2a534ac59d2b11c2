//! Shared run-state document access.
//!
//! All mutations are read-merge-write against the store, serialized within
//! this process by a mutex. Concurrent writers in other processes resolve
//! last-write-wins.

use std::sync::Arc;

use loom_core::run::RunStatus;
use loom_core::run_state::RunStateDocument;
use loom_core::types::Timestamp;
use tokio::sync::Mutex;

use crate::error::StoreResult;
use crate::run_store::RunStore;

pub struct RunStateManifest {
    store: Arc<dyn RunStore>,
    lock: Mutex<()>,
}

impl RunStateManifest {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> StoreResult<RunStateDocument> {
        self.store.load_run_state().await
    }

    /// Order `candidates` for scanning: paused runs dropped, then priority,
    /// sequence and run number ascending, `preferred` pinned to the front.
    pub async fn prioritize_runs(
        &self,
        candidates: &[String],
        preferred: Option<&str>,
    ) -> StoreResult<Vec<String>> {
        let document = self.store.load_run_state().await?;
        Ok(document.prioritize_runs(candidates, preferred))
    }

    pub async fn pause_run(&self, run_id: &str, paused: bool) -> StoreResult<()> {
        self.update(|doc| doc.entry_mut(run_id).paused = paused).await?;
        tracing::info!(run_id, paused, "Run pause flag updated");
        Ok(())
    }

    pub async fn set_run_priority(&self, run_id: &str, priority: i64) -> StoreResult<()> {
        self.update(|doc| doc.entry_mut(run_id).priority = Some(priority))
            .await?;
        tracing::info!(run_id, priority, "Run priority updated");
        Ok(())
    }

    pub async fn set_run_sequence(&self, run_id: &str, sequence: Option<i64>) -> StoreResult<()> {
        self.update(|doc| doc.entry_mut(run_id).sequence = sequence)
            .await
    }

    /// Mirror a run's latest aggregate status into its entry.
    pub async fn record_activity(
        &self,
        run_id: &str,
        status: RunStatus,
        last_activity: Timestamp,
        worker: &str,
    ) -> StoreResult<()> {
        self.update(|doc| {
            let entry = doc.entry_mut(run_id);
            entry.status = Some(status);
            entry.last_activity = Some(last_activity);
            entry.last_worker = Some(worker.to_string());
        })
        .await
    }

    async fn update<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut RunStateDocument),
    {
        let _guard = self.lock.lock().await;
        let mut document = self.store.load_run_state().await?;
        mutate(&mut document);
        self.store.save_run_state(&document).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
