// src/config.rs

//! Manages coordinator configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/roleswitch/roleswitch.toml";

/// Where resource status is read from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    /// `drbdadm status <resource>` (DRBD 9 and 8.4 utilities).
    #[default]
    DrbdAdm,
    /// The `/proc/drbd` pseudo file (DRBD 8 kernel module).
    Proc,
}

/// How the replication subsystem is queried and commanded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationSettings {
    #[serde(default = "default_drbdadm")]
    pub command: String,
    #[serde(default)]
    pub status_source: StatusSource,
    #[serde(default = "default_proc_path")]
    pub proc_path: PathBuf,
    /// The device minor of the resource, used to select its `/proc/drbd` entry.
    /// Resolved with `drbdadm sh-minor` when absent.
    #[serde(default)]
    pub minor: Option<u32>,
    /// The block device of the resource. Resolved with `drbdadm sh-dev` when absent.
    #[serde(default)]
    pub device: Option<PathBuf>,
    #[serde(with = "humantime_serde", default = "default_status_timeout")]
    pub status_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            command: default_drbdadm(),
            status_source: StatusSource::default(),
            proc_path: default_proc_path(),
            minor: None,
            device: None,
            status_timeout: default_status_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_drbdadm() -> String {
    "drbdadm".to_string()
}
fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc/drbd")
}
fn default_status_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Settings for the per-resource execution lock.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockSettings {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
    #[serde(with = "humantime_serde", default = "default_lock_max_wait")]
    pub max_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_lock_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            max_wait: default_lock_max_wait(),
            poll_interval: default_lock_poll_interval(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/roleswitch")
}
fn default_lock_max_wait() -> Duration {
    Duration::from_secs(60)
}
fn default_lock_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// The replicated filesystem and how it is mounted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilesystemSettings {
    pub mount_point: PathBuf,
    /// Filesystem type passed to `mount`. Probed from the device when absent.
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_options: Option<String>,
    #[serde(default = "default_unmount_retries")]
    pub unmount_retries: u32,
    #[serde(with = "humantime_serde", default = "default_unmount_backoff")]
    pub unmount_backoff: Duration,
}

impl Default for FilesystemSettings {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/srv/nfs"),
            fs_type: None,
            mount_options: None,
            unmount_retries: default_unmount_retries(),
            unmount_backoff: default_unmount_backoff(),
        }
    }
}

fn default_unmount_retries() -> u32 {
    3
}
fn default_unmount_backoff() -> Duration {
    Duration::from_secs(2)
}

/// The dependent export stack.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceSettings {
    #[serde(default = "default_export_service")]
    pub export_service: String,
    #[serde(default = "default_rpc_service")]
    pub rpc_service: String,
    /// Other local services that need the RPC service. While any of them is active,
    /// demotion leaves the RPC service running.
    #[serde(default)]
    pub rpc_consumers: Vec<String>,
    /// Daemons that may survive a service stop and are killed directly.
    #[serde(default = "default_residual_processes")]
    pub residual_processes: Vec<String>,
    #[serde(default = "default_stop_retries")]
    pub stop_retries: u32,
    #[serde(with = "humantime_serde", default = "default_stop_backoff")]
    pub stop_backoff: Duration,
    /// Deadline for the whole export-service stop escalation: the graceful attempts
    /// share its first half, the SIGKILL phase gets the rest. Each `systemctl` call
    /// is capped separately at 5s. Also bounds a single start job.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
    /// After promotion, check that the mount point shows up in the export table.
    #[serde(default = "default_true")]
    pub verify_export: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            export_service: default_export_service(),
            rpc_service: default_rpc_service(),
            rpc_consumers: Vec::new(),
            residual_processes: default_residual_processes(),
            stop_retries: default_stop_retries(),
            stop_backoff: default_stop_backoff(),
            stop_timeout: default_stop_timeout(),
            verify_export: true,
        }
    }
}

fn default_export_service() -> String {
    "nfs-server".to_string()
}
fn default_rpc_service() -> String {
    "rpcbind".to_string()
}
fn default_residual_processes() -> Vec<String> {
    vec!["rpc.mountd".to_string(), "rpc.statd".to_string()]
}
fn default_stop_retries() -> u32 {
    3
}
fn default_stop_backoff() -> Duration {
    Duration::from_secs(2)
}
fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}

/// Promotion-specific tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PromotionSettings {
    /// How long promotion waits for an in-progress resync before proceeding with a warning.
    #[serde(with = "humantime_serde", default = "default_sync_wait")]
    pub sync_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_sync_poll_interval")]
    pub sync_poll_interval: Duration,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            sync_wait: default_sync_wait(),
            sync_poll_interval: default_sync_poll_interval(),
        }
    }
}

fn default_sync_wait() -> Duration {
    Duration::from_secs(120)
}
fn default_sync_poll_interval() -> Duration {
    Duration::from_secs(5)
}

/// The resolved and validated configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub resource: String,
    /// Tracing filter directives. When unset, see [`Config::log_filter`].
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub lock: LockSettings,
    pub filesystem: FilesystemSettings,
    #[serde(default)]
    pub services: ServiceSettings,
    #[serde(default)]
    pub promotion: PromotionSettings,
}

/// The filter used when no log level is configured.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// The filter used by promote and demote when no log level is configured. State
/// machine transitions of the core are logged at debug level.
pub const TRANSITION_LOG_FILTER: &str = "info,roleswitch::core=debug";

impl Default for Config {
    fn default() -> Self {
        Self {
            resource: "r0".to_string(),
            log_level: None,
            replication: ReplicationSettings::default(),
            lock: LockSettings::default(),
            filesystem: FilesystemSettings::default(),
            services: ServiceSettings::default(),
            promotion: PromotionSettings::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.resource.trim().is_empty() {
            return Err(anyhow!("resource cannot be empty"));
        }
        if self.resource.contains('/') || self.resource.contains(char::is_whitespace) {
            return Err(anyhow!(
                "resource '{}' must not contain '/' or whitespace",
                self.resource
            ));
        }
        if self.replication.command.trim().is_empty() {
            return Err(anyhow!("replication.command cannot be empty"));
        }
        if self.replication.status_source == StatusSource::Proc
            && self.replication.proc_path.as_os_str().is_empty()
        {
            return Err(anyhow!(
                "replication.proc_path cannot be empty when status_source is 'proc'"
            ));
        }
        if self.replication.status_timeout.is_zero() {
            return Err(anyhow!("replication.status_timeout cannot be 0"));
        }
        if self.replication.command_timeout.is_zero() {
            return Err(anyhow!("replication.command_timeout cannot be 0"));
        }

        if self.lock.poll_interval.is_zero() {
            return Err(anyhow!("lock.poll_interval cannot be 0"));
        }
        if self.lock.poll_interval > self.lock.max_wait {
            return Err(anyhow!("lock.poll_interval cannot exceed lock.max_wait"));
        }

        if !self.filesystem.mount_point.is_absolute() {
            return Err(anyhow!(
                "filesystem.mount_point must be an absolute path, got '{}'",
                self.filesystem.mount_point.display()
            ));
        }
        if self.filesystem.mount_point.parent().is_none() {
            return Err(anyhow!("filesystem.mount_point cannot be '/'"));
        }
        if self.filesystem.unmount_retries == 0 {
            return Err(anyhow!("filesystem.unmount_retries cannot be 0"));
        }

        if self.services.export_service.trim().is_empty() {
            return Err(anyhow!("services.export_service cannot be empty"));
        }
        if self.services.rpc_service.trim().is_empty() {
            return Err(anyhow!("services.rpc_service cannot be empty"));
        }
        if self.services.stop_retries == 0 {
            return Err(anyhow!("services.stop_retries cannot be 0"));
        }
        if self.services.stop_timeout.is_zero() {
            return Err(anyhow!("services.stop_timeout cannot be 0"));
        }

        if self.promotion.sync_poll_interval.is_zero() {
            return Err(anyhow!("promotion.sync_poll_interval cannot be 0"));
        }
        Ok(())
    }

    /// The tracing filter for a run. `transition` selects the more verbose default
    /// of the promote and demote commands.
    pub fn log_filter(&self, transition: bool) -> String {
        match &self.log_level {
            Some(level) => level.clone(),
            None if transition => TRANSITION_LOG_FILTER.to_string(),
            None => DEFAULT_LOG_FILTER.to_string(),
        }
    }

    /// Settings that are valid but weaken a safety margin. Logged once logging is up.
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.promotion.sync_wait.is_zero() {
            notes.push(
                "promotion.sync_wait is 0: promotion will never wait for an in-progress resync"
                    .to_string(),
            );
        }
        notes
    }
}
