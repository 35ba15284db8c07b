// src/core/status/parser.rs

//! Parsers for the two textual status formats of the replication subsystem.

use super::{ConnectionState, DiskState, ResourceStatus, Role};
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the first line of a `/proc/drbd` device entry, e.g. ` 0: cs:Connected ro:...`.
static PROC_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+):\s+cs:(\S+)(.*)$").expect("static regex"));

/// Matches the resync progress marker of `/proc/drbd`, e.g. `sync'ed: 12.3%`.
static PROC_SYNCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sync'ed:\s*([0-9]+(?:\.[0-9]+)?)%").expect("static regex"));

/// Parses the output of `drbdadm status <resource>`.
///
/// ```text
/// r0 role:Primary
///   disk:UpToDate
///   peer role:Secondary
///     replication:SyncSource peer-disk:Inconsistent done:42.17
/// ```
///
/// A connected peer is printed without a `connection:` key; a disconnected one
/// carries `connection:<state>` and no role. Resources with several volumes print
/// one `volume:N` line per volume; their disk states are folded with `merge_disk`,
/// and the reported progress is that of the least synchronized volume.
pub fn parse_drbdadm_status(resource: &str, text: &str) -> ResourceStatus {
    let mut status = ResourceStatus::unknown(resource);
    let mut in_block = false;
    let mut seen_peer = false;
    let mut peer_connection_key = false;
    let mut disk: Option<DiskState> = None;
    let mut peer_disk: Option<DiskState> = None;
    let mut replication: Option<ConnectionState> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        let mut tokens = line.split_whitespace();

        if !indented {
            // A new resource header; only ours is of interest.
            if in_block {
                break;
            }
            if tokens.next() == Some(resource) {
                in_block = true;
                status.resource_exists = true;
                for (key, value) in tokens.filter_map(|t| t.split_once(':')) {
                    if key == "role" {
                        status.local_role = Role::from_token(value);
                    }
                }
            }
            continue;
        }
        if !in_block {
            continue;
        }

        let first = line.split_whitespace().next().unwrap_or_default();
        if !first.contains(':') {
            // A peer line starts with the peer's host name. Additional peers are ignored.
            if seen_peer {
                break;
            }
            seen_peer = true;
            for (key, value) in tokens.skip(1).filter_map(|t| t.split_once(':')) {
                match key {
                    "role" => status.peer_role = Role::from_token(value),
                    "connection" => {
                        peer_connection_key = true;
                        status.connection = ConnectionState::from_token(value);
                    }
                    _ => {}
                }
            }
            continue;
        }

        for (key, value) in tokens.filter_map(|t| t.split_once(':')) {
            match (key, seen_peer) {
                ("disk", false) => merge_disk(&mut disk, DiskState::from_token(value)),
                ("peer-disk", true) => merge_disk(&mut peer_disk, DiskState::from_token(value)),
                ("replication", true) => {
                    let state = ConnectionState::from_token(value);
                    replication = match replication {
                        None => Some(state),
                        Some(seen) if seen == state => Some(seen),
                        Some(_) => Some(ConnectionState::Unknown),
                    };
                }
                ("done", true) => {
                    if let Some(pct) = parse_percent(value) {
                        status.sync_percent =
                            Some(status.sync_percent.map_or(pct, |lowest| lowest.min(pct)));
                    }
                }
                _ => {}
            }
        }
    }

    status.disk_state = disk.unwrap_or(DiskState::Unknown);
    status.peer_disk_state = peer_disk.unwrap_or(DiskState::Unknown);
    if !peer_connection_key && let Some(state) = replication {
        status.connection = state;
    }
    if seen_peer && !peer_connection_key && status.peer_role != Role::Unknown {
        // The peer line printed a role and no connection key: the link is up.
        if status.connection == ConnectionState::Unknown && replication.is_none() {
            status.connection = ConnectionState::Connected;
        }
    }

    status
}

/// Folds one more volume's disk state into the resource-wide state.
///
/// Any volume that is not `UpToDate` decides the result; two volumes that are
/// degraded in different ways give `Unknown`.
fn merge_disk(acc: &mut Option<DiskState>, next: DiskState) {
    *acc = Some(match *acc {
        None => next,
        Some(seen) if seen == next => seen,
        Some(DiskState::UpToDate) => next,
        Some(seen) if next == DiskState::UpToDate => seen,
        Some(_) => DiskState::Unknown,
    });
}

/// Parses the contents of `/proc/drbd` for the entry with the given minor number.
/// Without an entry for `minor` the resource is reported as not existing.
///
/// ```text
///  0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----
///     ns:0 nr:0 dw:0 dr:0 al:0 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:1024
///     [==>.................] sync'ed: 15.2% (868/1024)M
/// ```
pub fn parse_proc_drbd(resource: &str, minor: u32, text: &str) -> ResourceStatus {
    let mut status = ResourceStatus::unknown(resource);
    let mut in_entry = false;

    for line in text.lines() {
        if let Some(caps) = PROC_ENTRY.captures(line) {
            if in_entry {
                break;
            }
            if caps[1].parse::<u32>().ok() != Some(minor) {
                continue;
            }
            let cs = &caps[2];
            if cs == "Unconfigured" {
                break;
            }

            in_entry = true;
            status.resource_exists = true;
            status.connection = ConnectionState::from_token(cs);
            for (key, value) in caps[3].split_whitespace().filter_map(|t| t.split_once(':')) {
                let (local, peer) = value.split_once('/').unwrap_or((value, ""));
                match key {
                    "ro" | "st" => {
                        status.local_role = Role::from_token(local);
                        status.peer_role = Role::from_token(peer);
                    }
                    "ds" => {
                        status.disk_state = DiskState::from_token(local);
                        status.peer_disk_state = DiskState::from_token(peer);
                    }
                    _ => {}
                }
            }
            continue;
        }

        if in_entry && let Some(caps) = PROC_SYNCED.captures(line) {
            status.sync_percent = parse_percent(&caps[1]);
        }
    }

    status
}

/// Parses the output of `drbdadm role <resource>`, which is either `Primary`
/// (DRBD 9) or `Primary/Secondary` (DRBD 8).
pub fn parse_role_output(text: &str) -> (Role, Role) {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    match line.split_once('/') {
        Some((local, peer)) => (Role::from_token(local), Role::from_token(peer)),
        None => (Role::from_token(line), Role::Unknown),
    }
}

/// Parses a completion percentage, rejecting anything outside `[0, 100]`.
fn parse_percent(value: &str) -> Option<f64> {
    let pct: f64 = value.trim().trim_end_matches('%').parse().ok()?;
    (0.0..=100.0).contains(&pct).then_some(pct)
}
