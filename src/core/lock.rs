// src/core/lock.rs

//! Exclusive Execution Lock: serializes promotion and demotion runs against one
//! resource on this node.
//!
//! The lock is a marker file created with `O_CREAT | O_EXCL` and naming the owning
//! process. A marker whose owner is no longer alive is stale and is reclaimed, so a
//! lock never survives the process that took it.

use crate::config::LockSettings;
use crate::core::errors::{Result, RoleSwitchError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The identity recorded in a lock marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn to_marker(&self) -> String {
        format!(
            "{}\n{}\n",
            self.pid,
            self.acquired_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    fn from_marker(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let acquired_at = DateTime::parse_from_rfc3339(lines.next()?.trim())
            .ok()?
            .with_timezone(&Utc);
        Some(Self { pid, acquired_at })
    }
}

/// Acquires per-resource lock handles with a bounded wait.
#[derive(Debug, Clone)]
pub struct ExecutionLock {
    dir: PathBuf,
    max_wait: Duration,
    poll_interval: Duration,
}

impl ExecutionLock {
    pub fn new(settings: &LockSettings) -> Self {
        Self {
            dir: settings.dir.clone(),
            max_wait: settings.max_wait,
            poll_interval: settings.poll_interval,
        }
    }

    pub fn path_for(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{resource}.lock"))
    }

    /// Takes the lock for `resource`, polling every `poll_interval` while another
    /// live process holds it. Fails with `LockTimeout` once `max_wait` has elapsed.
    pub async fn acquire(&self, resource: &str) -> Result<LockHandle> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(resource);
        let started = Instant::now();
        let deadline = started + self.max_wait;

        loop {
            let owner = LockOwner::current();
            match try_create(&path, &owner) {
                Ok(()) => {
                    info!(
                        "Acquired execution lock for '{}' (pid {}) after {:?}.",
                        resource,
                        owner.pid,
                        started.elapsed()
                    );
                    return Ok(LockHandle {
                        path,
                        resource: resource.to_string(),
                        owner,
                        released: AtomicBool::new(false),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_owner(&path) {
                Some(holder) if !pid_alive(holder.pid) => {
                    warn!(
                        "Execution lock for '{}' is held by dead process {} (since {}); reclaiming.",
                        resource, holder.pid, holder.acquired_at
                    );
                    reclaim_if_stale(&path, &holder)?;
                    continue;
                }
                Some(holder) => debug!(
                    "Execution lock for '{}' held by pid {} since {}; waiting.",
                    resource, holder.pid, holder.acquired_at
                ),
                None => debug!("Execution lock for '{}' is being written; waiting.", resource),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RoleSwitchError::LockTimeout {
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Proof of lock ownership. Released explicitly or on drop, whichever comes first.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    resource: String,
    owner: LockOwner,
    released: AtomicBool,
}

impl LockHandle {
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Removes the marker if it still names this owner. Safe to call repeatedly.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match read_owner(&self.path) {
            Some(holder) if holder == self.owner => match fs::remove_file(&self.path) {
                Ok(()) => info!("Released execution lock for '{}'.", self.resource),
                Err(e) => warn!(
                    "Failed to remove execution lock marker {}: {}",
                    self.path.display(),
                    e
                ),
            },
            Some(holder) => warn!(
                "Execution lock for '{}' now names pid {}; leaving it in place.",
                self.resource, holder.pid
            ),
            None => debug!("Execution lock for '{}' was already gone.", self.resource),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_create(path: &Path, owner: &LockOwner) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file
        .write_all(owner.to_marker().as_bytes())
        .and_then(|_| file.sync_all())
    {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| LockOwner::from_marker(&s))
}

/// Removes a stale marker under an advisory guard, so two waiters cannot both
/// reclaim and one of them delete the other's fresh marker.
fn reclaim_if_stale(path: &Path, stale: &LockOwner) -> io::Result<()> {
    let guard_path = path.with_extension("lock.guard");
    let guard = File::create(&guard_path)?;
    // SAFETY: `guard` owns a valid open descriptor for the duration of the call.
    if unsafe { libc::flock(guard.as_raw_fd(), libc::LOCK_EX) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if read_owner(path).as_ref() == Some(stale) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    // Dropping the descriptor releases the flock.
    drop(guard);
    Ok(())
}

/// Reports whether a process with this pid exists.
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
