// src/core/status/mod.rs

//! The typed view of a replicated resource's state.
//!
//! Status text from the replication subsystem is parsed exactly once, at the
//! boundary, into a [`ResourceStatus`]. Any field that cannot be parsed is kept
//! as `Unknown`; callers must treat `Unknown` as a potential hazard.

use serde::Serialize;
use std::fmt;
use strum_macros::{Display, EnumString};

pub mod parser;
pub mod reader;
pub mod watch;

pub use reader::StatusReader;

/// The role of one node for a replicated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(ascii_case_insensitive)]
pub enum Role {
    Primary,
    Secondary,
    Unknown,
}

impl Role {
    /// Parses a role token. Anything unrecognised becomes `Unknown`.
    pub fn from_token(token: &str) -> Self {
        token.trim().parse().unwrap_or(Role::Unknown)
    }
}

/// The replication link state as seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum ConnectionState {
    Connected,
    StandAlone,
    Unconnected,
    Connecting,
    Disconnecting,
    Unknown,
}

impl ConnectionState {
    /// Maps a connection-state token (either DRBD 8 `cs:` or DRBD 9 `connection:`/`replication:`)
    /// onto the reduced state set.
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "Connected" | "Established" | "SyncSource" | "SyncTarget" | "WFBitMapS"
            | "WFBitMapT" | "WFSyncUUID" | "PausedSyncS" | "PausedSyncT" | "StartingSyncS"
            | "StartingSyncT" | "VerifyS" | "VerifyT" | "Ahead" | "Behind" => {
                ConnectionState::Connected
            }
            "StandAlone" => ConnectionState::StandAlone,
            "Unconnected" => ConnectionState::Unconnected,
            "Connecting" | "WFConnection" | "WFReportParams" => ConnectionState::Connecting,
            "Disconnecting" | "TearDown" => ConnectionState::Disconnecting,
            _ => ConnectionState::Unknown,
        }
    }

    /// True for the states in which the peer is definitely not reachable.
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            ConnectionState::StandAlone | ConnectionState::Unconnected | ConnectionState::Connecting
        )
    }
}

/// The state of a backing disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum DiskState {
    UpToDate,
    Inconsistent,
    Outdated,
    Diskless,
    Failed,
    Unknown,
}

impl DiskState {
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "UpToDate" => DiskState::UpToDate,
            "Inconsistent" => DiskState::Inconsistent,
            "Outdated" => DiskState::Outdated,
            "Diskless" => DiskState::Diskless,
            "Failed" => DiskState::Failed,
            _ => DiskState::Unknown,
        }
    }
}

/// A coarse classification of replication progress, used by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SyncPhase {
    /// The local node is waiting for the peer to connect.
    WaitingForPeer,
    /// A resync is running at the given completion percentage.
    Syncing(f64),
    /// Connected with both disks up to date.
    Synchronized,
    Unknown,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::WaitingForPeer => write!(f, "waiting for peer"),
            SyncPhase::Syncing(pct) => write!(f, "syncing ({pct:.1}%)"),
            SyncPhase::Synchronized => write!(f, "synchronized"),
            SyncPhase::Unknown => write!(f, "unknown"),
        }
    }
}

/// A point-in-time snapshot of one replicated resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub resource: String,
    pub local_role: Role,
    pub peer_role: Role,
    pub connection: ConnectionState,
    pub disk_state: DiskState,
    pub peer_disk_state: DiskState,
    /// Resync completion in `[0, 100]`; `None` when no resync is in progress.
    pub sync_percent: Option<f64>,
    pub resource_exists: bool,
}

impl ResourceStatus {
    /// A snapshot in which nothing is known, the starting point of every parse.
    pub fn unknown(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            local_role: Role::Unknown,
            peer_role: Role::Unknown,
            connection: ConnectionState::Unknown,
            disk_state: DiskState::Unknown,
            peer_disk_state: DiskState::Unknown,
            sync_percent: None,
            resource_exists: false,
        }
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self.sync_percent, Some(pct) if pct < 100.0)
    }

    pub fn sync_phase(&self) -> SyncPhase {
        if let Some(pct) = self.sync_percent
            && pct < 100.0
        {
            return SyncPhase::Syncing(pct);
        }
        match self.connection {
            ConnectionState::Connecting | ConnectionState::Unconnected => SyncPhase::WaitingForPeer,
            ConnectionState::Connected
                if self.disk_state == DiskState::UpToDate
                    && self.peer_disk_state == DiskState::UpToDate =>
            {
                SyncPhase::Synchronized
            }
            _ => SyncPhase::Unknown,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource={} role={}/{} connection={} disk={}/{}",
            self.resource,
            self.local_role,
            self.peer_role,
            self.connection,
            self.disk_state,
            self.peer_disk_state
        )?;
        if let Some(pct) = self.sync_percent {
            write!(f, " sync={pct:.1}%")?;
        }
        Ok(())
    }
}
