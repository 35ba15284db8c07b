// src/core/status/watch.rs

//! Polls a resource and records every change of its synchronization phase.

use super::{ResourceStatus, StatusReader, SyncPhase};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{info, warn};

/// One recorded phase change.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

pub struct SyncWatcher {
    reader: StatusReader,
    resource: String,
    max_history: usize,
    history: VecDeque<HistoryEntry>,
    last_message: Option<String>,
    last_status: Option<ResourceStatus>,
}

impl SyncWatcher {
    pub fn new(reader: StatusReader, resource: &str, max_history: usize) -> Self {
        Self {
            reader,
            resource: resource.to_string(),
            max_history: max_history.max(1),
            history: VecDeque::new(),
            last_message: None,
            last_status: None,
        }
    }

    /// Performs one poll and returns the observed phase. A failed read is recorded
    /// in the history and reported as `SyncPhase::Unknown`.
    pub async fn observe(&mut self) -> SyncPhase {
        let (phase, message) = match self.reader.read(&self.resource).await {
            Ok(status) => {
                let phase = status.sync_phase();
                let message = format!("{phase}: {status}");
                self.last_status = Some(status);
                (phase, message)
            }
            Err(e) => {
                warn!("Status of '{}' unavailable: {}", self.resource, e);
                self.last_status = None;
                (SyncPhase::Unknown, format!("status unavailable: {e}"))
            }
        };

        if self.last_message.as_deref() != Some(message.as_str()) {
            info!("{}: {}", self.resource, message);
            self.history.push_back(HistoryEntry {
                at: Local::now(),
                message: message.clone(),
            });
            while self.history.len() > self.max_history {
                self.history.pop_front();
            }
            self.last_message = Some(message);
        }
        phase
    }

    /// Polls every `interval`. With `until_synced`, returns once the resource is
    /// synchronized; otherwise polls until the future is dropped.
    pub async fn run(&mut self, interval: Duration, until_synced: bool) -> SyncPhase {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let phase = self.observe().await;
            if until_synced && phase == SyncPhase::Synchronized {
                return phase;
            }
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn last_status(&self) -> Option<&ResourceStatus> {
        self.last_status.as_ref()
    }
}
