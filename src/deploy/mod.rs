//! Deploy executor & SSE state machine.
//!
//! A sharded map keyed by environment name, one entry per environment, each
//! guarded by its own mutex plus a `Notify` used to wake SSE pumps as soon as
//! new output lands rather than relying solely on the fallback poll tick —
//! the per-environment-actor idea generalised from a debounced coalescing
//! actor into a serialised-deploy-plus-output-buffer actor.

pub mod executor;
pub mod sse;

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

/// Quiet period after a deploy finishes during which new deploys for the same
/// environment are rejected. A correctness feature against duplicate triggers
/// from reverse proxies, not a rate limiter.
pub const COOLDOWN_SECS: i64 = 5;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Output,
    Done,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Output => "output",
            EventKind::Done => "done",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub event: EventKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub success: bool,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

#[derive(Debug, Default)]
pub struct DeployState {
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub output_buffer: Vec<EventRecord>,
    pub next_id: u64,
    pub last_result: Option<DeployResult>,
}

/// Per-environment deploy state plus the wake mechanism for SSE pumps.
pub struct DeployEntry {
    pub state: Mutex<DeployState>,
    pub notify: Notify,
}

impl DeployEntry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DeployState::default()),
            notify: Notify::new(),
        }
    }
}

#[derive(Clone)]
pub struct DeployStore {
    entries: Arc<RwLock<HashMap<String, Arc<DeployEntry>>>>,
}

impl Default for DeployStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeployStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn entry(&self, env: &str) -> Arc<DeployEntry> {
        if let Some(entry) = self.entries.read().await.get(env) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(env.to_string())
                .or_insert_with(|| Arc::new(DeployEntry::new())),
        )
    }
}

pub struct StatusSnapshot {
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub buffered_count: usize,
    pub last_result: Option<DeployResult>,
}

pub async fn status_snapshot(entry: &DeployEntry) -> StatusSnapshot {
    let state = entry.state.lock().await;
    StatusSnapshot {
        running: state.running,
        start_time: state.start_time,
        buffered_count: state.output_buffer.len(),
        last_result: state.last_result.clone(),
    }
}

/// Gate + transition for a fresh deploy. Rejects with `Conflict` if one is
/// already running or the cooldown hasn't elapsed.
pub async fn try_start(entry: &DeployEntry) -> Result<(), Error> {
    let mut state = entry.state.lock().await;

    if state.running {
        return Err(Error::Conflict {
            reason: "deploy already in progress".to_string(),
        });
    }

    if let Some(last) = &state.last_result {
        let elapsed_ms = Utc::now()
            .signed_duration_since(last.end_time)
            .num_milliseconds();
        if elapsed_ms < COOLDOWN_SECS * 1000 {
            return Err(Error::Conflict {
                reason: "deploy cooldown in effect".to_string(),
            });
        }
    }

    state.running = true;
    state.start_time = Some(Utc::now());
    state.output_buffer.clear();
    state.next_id = 1;
    state.last_result = None;

    Ok(())
}
