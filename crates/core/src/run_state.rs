//! Run-state document (`runs/state.json`) and run prioritization.
//!
//! The document is shared by every worker and by operator tooling. It holds
//! per-run scheduling controls (priority, pause, explicit sequence) and the
//! last aggregate status pushed by a worker. Persistence lives in
//! `loom-store`; this module only defines the shape and the ordering rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::run::{parse_run_number, RunStatus};
use crate::types::Timestamp;

/// Priority assigned to runs without an explicit entry. Lower runs first.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Tiebreak used for run ids that are not numeric; sorts them after every
/// numeric id.
const NON_NUMERIC_TIEBREAK: i64 = 1_000_000_000;

/// Per-run scheduling controls and last reported activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStateEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_worker: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateDefaults {
    #[serde(default = "default_priority")]
    pub priority: i64,
}

impl Default for RunStateDefaults {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
        }
    }
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// The whole shared run-state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStateDocument {
    #[serde(default)]
    pub runs: BTreeMap<String, RunStateEntry>,
    #[serde(default)]
    pub default: RunStateDefaults,
}

impl RunStateDocument {
    pub fn entry(&self, run_id: &str) -> Option<&RunStateEntry> {
        self.runs.get(run_id)
    }

    pub fn entry_mut(&mut self, run_id: &str) -> &mut RunStateEntry {
        self.runs.entry(run_id.to_string()).or_default()
    }

    pub fn is_paused(&self, run_id: &str) -> bool {
        self.entry(run_id).is_some_and(|e| e.paused)
    }

    pub fn priority_of(&self, run_id: &str) -> i64 {
        self.entry(run_id)
            .and_then(|e| e.priority)
            .unwrap_or(self.default.priority)
    }

    /// Order `candidates` for scanning.
    ///
    /// Sort key: `(paused, priority, sequence or numeric run id, numeric run
    /// id, run id)`. Paused runs are dropped. `preferred`, when it is one of
    /// the candidates, is moved to the front even if paused: an explicit pin
    /// wins over the shared pause flag.
    pub fn prioritize_runs(&self, candidates: &[String], preferred: Option<&str>) -> Vec<String> {
        let mut keyed: Vec<((bool, i64, i64, i64), &String)> = candidates
            .iter()
            .map(|run_id| {
                let fallback = parse_run_number(run_id)
                    .ok()
                    .and_then(|n| i64::try_from(n).ok())
                    .unwrap_or(NON_NUMERIC_TIEBREAK);
                let entry = self.entry(run_id);
                let sequence = entry.and_then(|e| e.sequence).unwrap_or(fallback);
                (
                    (self.is_paused(run_id), self.priority_of(run_id), sequence, fallback),
                    run_id,
                )
            })
            .collect();
        keyed.sort();

        let mut ordered: Vec<String> = keyed
            .into_iter()
            .filter(|(_, run_id)| !self.is_paused(run_id))
            .map(|(_, run_id)| run_id.clone())
            .collect();

        if let Some(preferred) = preferred {
            if candidates.iter().any(|c| c == preferred) {
                ordered.retain(|run_id| run_id != preferred);
                ordered.insert(0, preferred.to_string());
            }
        }
        ordered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
