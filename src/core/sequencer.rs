// src/core/sequencer.rs

//! Service Sequencer: brings the export stack and the replicated filesystem up
//! after promotion and down before demotion.
//!
//! Stop ordering matters: exports are withdrawn before the export service is torn
//! down, and the service is fully gone before the filesystem is unmounted, so that
//! in-flight client writes are rejected instead of silently dropped.

use crate::config::{Config, FilesystemSettings, ServiceSettings};
use crate::core::errors::{Result, RoleSwitchError};
use crate::core::host::{Host, KillSignal, UnmountMode};
use crate::core::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often a stopping service is polled for inactivity.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ServiceSequencer {
    host: Host,
    services: ServiceSettings,
    filesystem: FilesystemSettings,
    stop_policy: RetryPolicy,
    unmount_policy: RetryPolicy,
}

impl ServiceSequencer {
    pub fn new(host: Host, config: &Config) -> Self {
        Self {
            host,
            services: config.services.clone(),
            filesystem: config.filesystem.clone(),
            stop_policy: RetryPolicy::exponential(
                config.services.stop_retries,
                config.services.stop_backoff,
                config.services.stop_backoff * 4,
            ),
            unmount_policy: RetryPolicy::fixed(
                config.filesystem.unmount_retries,
                config.filesystem.unmount_backoff,
            ),
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.filesystem.mount_point
    }

    pub fn export_service(&self) -> &str {
        &self.services.export_service
    }

    /// Start path, run after the node became primary. Every failure is fatal.
    pub async fn start_services(&self) -> Result<()> {
        let rpc = &self.services.rpc_service;
        let export = &self.services.export_service;

        if self.host.services.is_active(rpc).await? {
            debug!("RPC registration service '{}' already active.", rpc);
        } else {
            info!("Starting RPC registration service '{}'.", rpc);
            self.host.services.start(rpc).await?;
        }

        info!("Starting export service '{}'.", export);
        self.host.services.start(export).await?;
        if !self.host.services.is_active(export).await? {
            return Err(RoleSwitchError::ServiceStartFailed {
                service: export.clone(),
                reason: "service is not active after start".to_string(),
            });
        }

        info!("Re-asserting filesystem exports.");
        self.host.exports.export_all().await?;

        if self.services.verify_export {
            let mount_point = &self.filesystem.mount_point;
            if !self.host.exports.is_exported(mount_point).await? {
                return Err(RoleSwitchError::ServiceStartFailed {
                    service: export.clone(),
                    reason: format!("{} is not visible in the export table", mount_point.display()),
                });
            }
            debug!("Export of {} verified.", mount_point.display());
        }
        Ok(())
    }

    /// Stop path, run before the node gives up the primary role. Returns only once
    /// the export service is guaranteed to be stopped.
    pub async fn stop_services(&self) -> Result<()> {
        let export = &self.services.export_service;

        // Refuse new clients before tearing anything down.
        info!("Withdrawing all filesystem exports.");
        if let Err(e) = self.host.exports.unexport_all().await {
            if self.host.services.is_active(export).await? {
                return Err(e);
            }
            warn!("Unexport failed but '{}' is not running: {}", export, e);
        }

        self.stop_export_service().await?;

        for process in &self.services.residual_processes {
            match self.host.services.kill_residual(process).await {
                Ok(true) => warn!("Killed residual '{}' processes.", process),
                Ok(false) => debug!("No residual '{}' processes.", process),
                Err(e) => warn!("Could not check for residual '{}' processes: {}", process, e),
            }
        }

        self.stop_rpc_service().await;
        Ok(())
    }

    /// Graceful stop, retried with backoff, then forced termination.
    ///
    /// The whole escalation shares one `stop_timeout` deadline. Graceful attempts
    /// split its first half between them; the rest is left for the service to
    /// exit after SIGKILL.
    async fn stop_export_service(&self) -> Result<()> {
        let export = &self.services.export_service;

        if !self.host.services.is_active(export).await? {
            info!("Export service '{}' already stopped.", export);
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + self.services.stop_timeout;
        let graceful_end = started + self.services.stop_timeout / 2;
        let slice = self.services.stop_timeout / (2 * self.stop_policy.max_attempts);

        for attempt in self.stop_policy.attempts() {
            info!(
                "Stopping export service '{}' (attempt {}/{}).",
                export, attempt, self.stop_policy.max_attempts
            );
            if let Err(e) = self.host.services.stop(export).await {
                warn!("Stop of '{}' reported an error: {}", export, e);
            }
            let attempt_end = (Instant::now() + slice).min(graceful_end);
            if self.wait_inactive(export, attempt_end).await? {
                info!("Export service '{}' stopped.", export);
                return Ok(());
            }
            if !self.stop_policy.is_last(attempt) {
                let pause = self
                    .stop_policy
                    .delay_after(attempt)
                    .min(graceful_end.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }

        warn!(
            "Export service '{}' survived {} graceful stop attempts; sending SIGKILL.",
            export, self.stop_policy.max_attempts
        );
        if let Err(e) = self.host.services.kill(export, KillSignal::Kill).await {
            warn!("Forced kill of '{}' reported an error: {}", export, e);
        }
        if let Err(e) = self.host.services.stop(export).await {
            debug!("Final stop of '{}' reported an error: {}", export, e);
        }
        if self.wait_inactive(export, deadline).await? {
            info!("Export service '{}' stopped after forced termination.", export);
            return Ok(());
        }

        error!(
            "Export service '{}' is still active after {:?}.",
            export,
            started.elapsed()
        );
        Err(RoleSwitchError::ServiceStopFailed(export.clone()))
    }

    /// Polls until `service` is inactive or `deadline` passes. Checks at least once.
    async fn wait_inactive(&self, service: &str, deadline: Instant) -> Result<bool> {
        loop {
            if !self.host.services.is_active(service).await? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(remaining.min(STOP_POLL_INTERVAL)).await;
        }
    }

    /// Stops the RPC registration service unless another local consumer still needs it.
    /// Failure here does not affect data safety and is only logged.
    async fn stop_rpc_service(&self) {
        let rpc = &self.services.rpc_service;
        for consumer in &self.services.rpc_consumers {
            match self.host.services.is_active(consumer).await {
                Ok(true) => {
                    info!(
                        "Leaving '{}' running: '{}' still depends on it.",
                        rpc, consumer
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Could not query '{}' ({}); leaving '{}' running.",
                        consumer, e, rpc
                    );
                    return;
                }
            }
        }
        info!("Stopping RPC registration service '{}'.", rpc);
        if let Err(e) = self.host.services.stop(rpc).await {
            warn!("Failed to stop '{}': {}", rpc, e);
        }
    }

    /// Resolves, checks, and mounts the replicated device at the configured mount point.
    /// Returns the canonical device path that is mounted.
    pub async fn mount(&self, resource: &str) -> Result<PathBuf> {
        let mount_point = &self.filesystem.mount_point;
        let device = self.host.replication.device_path(resource).await?;

        if !self.host.filesystem.device_exists(&device).await? {
            return Err(RoleSwitchError::MountFailed(format!(
                "device {} does not exist",
                device.display()
            )));
        }
        let device = self.host.filesystem.canonical_device(&device).await?;

        let probed = self.host.filesystem.probe_fs_type(&device).await?;
        let Some(probed) = probed else {
            return Err(RoleSwitchError::MountFailed(format!(
                "device {} carries no recognizable filesystem",
                device.display()
            )));
        };
        let fs_type = match &self.filesystem.fs_type {
            Some(expected) if *expected != probed => {
                return Err(RoleSwitchError::MountFailed(format!(
                    "device {} carries {} but {} is configured",
                    device.display(),
                    probed,
                    expected
                )));
            }
            _ => probed,
        };

        match self.current_source().await? {
            Some(source) if source == device => {
                info!(
                    "{} already mounted at {}.",
                    device.display(),
                    mount_point.display()
                );
                return Ok(device);
            }
            Some(source) => {
                return Err(RoleSwitchError::MountFailed(format!(
                    "{} is occupied by {}, expected {}",
                    mount_point.display(),
                    source.display(),
                    device.display()
                )));
            }
            None => {}
        }

        info!(
            "Mounting {} ({}) at {}.",
            device.display(),
            fs_type,
            mount_point.display()
        );
        self.host
            .filesystem
            .mount(
                &device,
                mount_point,
                &fs_type,
                self.filesystem.mount_options.as_deref(),
            )
            .await?;

        match self.current_source().await? {
            Some(source) if source == device => Ok(device),
            other => Err(RoleSwitchError::MountFailed(format!(
                "mount reported success but {} shows {:?}",
                mount_point.display(),
                other
            ))),
        }
    }

    /// The canonical device currently mounted at the mount point.
    pub async fn current_source(&self) -> Result<Option<PathBuf>> {
        let mount_point = &self.filesystem.mount_point;
        match self.host.filesystem.mount_source(mount_point).await? {
            Some(source) => Ok(Some(
                self.host
                    .filesystem
                    .canonical_device(&source)
                    .await
                    .unwrap_or(source),
            )),
            None => Ok(None),
        }
    }

    /// Unmounts the replicated filesystem and verifies it is really gone.
    ///
    /// With open handles present the mount is detached lazily; otherwise a normal
    /// unmount is retried with backoff and forced on the final attempt.
    pub async fn unmount(&self, device: Option<&Path>) -> Result<()> {
        let mount_point = &self.filesystem.mount_point;
        if !self.still_mounted(device).await? {
            info!("{} is not mounted.", mount_point.display());
            return Ok(());
        }

        let holders = self.host.filesystem.open_handles(mount_point).await?;
        if !holders.is_empty() {
            for h in &holders {
                warn!(
                    "Process {} ({}) holds files open under {}.",
                    h.pid,
                    h.command,
                    mount_point.display()
                );
            }
        }

        for attempt in self.unmount_policy.attempts() {
            let mode = if !holders.is_empty() {
                UnmountMode::Lazy
            } else if self.unmount_policy.is_last(attempt) {
                UnmountMode::Force
            } else {
                UnmountMode::Normal
            };
            info!(
                "Unmounting {} ({:?}, attempt {}/{}).",
                mount_point.display(),
                mode,
                attempt,
                self.unmount_policy.max_attempts
            );
            if let Err(e) = self.host.filesystem.unmount(mount_point, mode).await {
                warn!("Unmount of {} failed: {}", mount_point.display(), e);
            }
            // A lazy unmount may succeed while the device is still referenced.
            if !self.still_mounted(device).await? {
                info!("{} unmounted.", mount_point.display());
                return Ok(());
            }
            self.unmount_policy.backoff(attempt).await;
        }

        error!(
            "{} is still mounted after {} attempts.",
            mount_point.display(),
            self.unmount_policy.max_attempts
        );
        Err(RoleSwitchError::UnmountFailed(
            mount_point.display().to_string(),
        ))
    }

    /// True if the mount point is mounted or the device is mounted anywhere.
    async fn still_mounted(&self, device: Option<&Path>) -> Result<bool> {
        if self.host.filesystem.is_mounted(&self.filesystem.mount_point).await? {
            return Ok(true);
        }
        if let Some(device) = device {
            let elsewhere = self.host.filesystem.device_mount_points(device).await?;
            if !elsewhere.is_empty() {
                warn!(
                    "{} is still mounted at {:?}.",
                    device.display(),
                    elsewhere
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}
