// src/core/host/mod.rs

//! The external collaborators the transition core observes and commands.
//!
//! Each collaborator is a trait so the controllers can be driven against an
//! in-memory cluster in tests. The production implementations shell out through
//! a [`CommandRunner`](crate::core::exec::CommandRunner).

use crate::config::Config;
use crate::core::errors::Result;
use crate::core::exec::{CommandRunner, SystemRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod drbd;
pub mod exports;
pub mod mount;
pub mod systemd;

pub use drbd::DrbdAdm;
pub use exports::ExportFs;
pub use mount::HostFilesystem;
pub use systemd::Systemd;

/// The textual format of a raw status dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    /// Output of `drbdadm status <resource>`.
    DrbdAdm,
    /// Contents of `/proc/drbd`, with the minor number of the resource's device.
    Proc { minor: u32 },
}

/// Unparsed status text as returned by the replication subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatus {
    pub format: StatusFormat,
    pub text: String,
}

/// The replication subsystem's query and role-change interface.
#[async_trait]
pub trait ReplicationControl: Send + Sync {
    async fn query_status(&self, resource: &str) -> Result<RawStatus>;
    async fn query_role(&self, resource: &str) -> Result<String>;
    /// Issues a plain promotion. Never forces.
    async fn promote(&self, resource: &str) -> Result<()>;
    async fn demote(&self, resource: &str) -> Result<()>;
    /// Resolves the block device backing `resource`.
    async fn device_path(&self, resource: &str) -> Result<PathBuf>;
}

/// Signals that can be delivered to a service's processes through the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Kill,
}

impl KillSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            KillSignal::Kill => "KILL",
        }
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn is_active(&self, service: &str) -> Result<bool>;
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn kill(&self, service: &str, signal: KillSignal) -> Result<()>;
    /// Force-kills stray processes named `process` that the service manager did not reap.
    /// Returns `true` if any were found.
    async fn kill_residual(&self, process: &str) -> Result<bool>;
}

/// The network file-export table.
#[async_trait]
pub trait ExportTable: Send + Sync {
    /// Re-asserts every configured export.
    async fn export_all(&self) -> Result<()>;
    /// Withdraws every export so no new client can attach.
    async fn unexport_all(&self) -> Result<()>;
    async fn is_exported(&self, path: &Path) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Normal,
    /// Detach now, clean up when the last reference goes away.
    Lazy,
    Force,
}

/// A process holding an open handle below a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub pid: u32,
    pub command: String,
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn device_exists(&self, device: &Path) -> Result<bool>;
    /// Returns the filesystem type carried by `device`, if any is recognisable.
    async fn probe_fs_type(&self, device: &Path) -> Result<Option<String>>;
    /// Resolves symlinks such as `/dev/drbd/by-res/r0/0` to the real device node.
    async fn canonical_device(&self, device: &Path) -> Result<PathBuf>;
    /// Returns the device mounted at `mount_point`, if anything is.
    async fn mount_source(&self, mount_point: &Path) -> Result<Option<PathBuf>>;
    /// Returns every mount point where `device` is currently mounted.
    async fn device_mount_points(&self, device: &Path) -> Result<Vec<PathBuf>>;
    async fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: Option<&str>,
    ) -> Result<()>;
    async fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> Result<()>;
    async fn open_handles(&self, mount_point: &Path) -> Result<Vec<OpenHandle>>;

    async fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        Ok(self.mount_source(mount_point).await?.is_some())
    }
}

/// The full set of collaborators a controller drives.
#[derive(Clone)]
pub struct Host {
    pub replication: Arc<dyn ReplicationControl>,
    pub services: Arc<dyn ServiceManager>,
    pub exports: Arc<dyn ExportTable>,
    pub filesystem: Arc<dyn Filesystem>,
}

impl Host {
    /// Builds the production collaborators, all sharing one command runner.
    pub fn system(config: &Config) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let timeout = config.replication.command_timeout;
        Self {
            replication: Arc::new(DrbdAdm::new(runner.clone(), &config.replication)),
            services: Arc::new(Systemd::new(runner.clone(), config.services.stop_timeout)),
            exports: Arc::new(ExportFs::new(runner.clone(), timeout)),
            filesystem: Arc::new(HostFilesystem::new(runner, timeout)),
        }
    }
}
