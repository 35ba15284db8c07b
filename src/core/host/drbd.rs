// src/core/host/drbd.rs

//! `drbdadm`-backed replication control.

use super::{RawStatus, ReplicationControl, StatusFormat};
use crate::config::{ReplicationSettings, StatusSource};
use crate::core::errors::{Result, RoleSwitchError};
use crate::core::exec::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Fragments of `drbdadm` error output that mean the resource does not exist.
const NOT_FOUND_MARKERS: &[&str] = &["not defined in your config", "No such resource", "Unknown resource"];

pub struct DrbdAdm {
    runner: Arc<dyn CommandRunner>,
    command: String,
    source: StatusSource,
    proc_path: PathBuf,
    minor: Option<u32>,
    device: Option<PathBuf>,
    status_timeout: Duration,
    command_timeout: Duration,
}

impl DrbdAdm {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &ReplicationSettings) -> Self {
        Self {
            runner,
            command: settings.command.clone(),
            source: settings.status_source,
            proc_path: settings.proc_path.clone(),
            minor: settings.minor,
            device: settings.device.clone(),
            status_timeout: settings.status_timeout,
            command_timeout: settings.command_timeout,
        }
    }

    async fn drbdadm(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let output = self.runner.run(&self.command, args, timeout).await?;
        if !output.success()
            && let Some(resource) = args.last()
            && NOT_FOUND_MARKERS.iter().any(|m| output.stderr.contains(m))
        {
            return Err(RoleSwitchError::ResourceNotFound(resource.to_string()));
        }
        output.into_result(&self.command)
    }

    /// The device minor of `resource`: the configured one, else `drbdadm sh-minor`.
    async fn minor_of(&self, resource: &str) -> Result<u32> {
        if let Some(minor) = self.minor {
            return Ok(minor);
        }
        let output = self.drbdadm(&["sh-minor", resource], self.status_timeout).await?;
        let reported = output.stdout.lines().map(str::trim).find(|l| !l.is_empty());
        reported
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| {
                RoleSwitchError::StatusUnavailable(format!(
                    "no device minor reported for '{resource}': {:?}",
                    output.stdout.trim()
                ))
            })
    }
}

#[async_trait]
impl ReplicationControl for DrbdAdm {
    async fn query_status(&self, resource: &str) -> Result<RawStatus> {
        match self.source {
            StatusSource::DrbdAdm => {
                let output = self.drbdadm(&["status", resource], self.status_timeout).await?;
                Ok(RawStatus {
                    format: StatusFormat::DrbdAdm,
                    text: output.stdout,
                })
            }
            StatusSource::Proc => {
                let minor = self.minor_of(resource).await?;
                let text = tokio::fs::read_to_string(&self.proc_path).await?;
                Ok(RawStatus {
                    format: StatusFormat::Proc { minor },
                    text,
                })
            }
        }
    }

    async fn query_role(&self, resource: &str) -> Result<String> {
        let output = self.drbdadm(&["role", resource], self.status_timeout).await?;
        Ok(output.stdout)
    }

    async fn promote(&self, resource: &str) -> Result<()> {
        self.drbdadm(&["primary", resource], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn demote(&self, resource: &str) -> Result<()> {
        self.drbdadm(&["secondary", resource], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn device_path(&self, resource: &str) -> Result<PathBuf> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        let output = self.drbdadm(&["sh-dev", resource], self.status_timeout).await?;
        let device = output.stdout.lines().map(str::trim).find(|l| !l.is_empty());
        device.map(PathBuf::from).ok_or_else(|| {
            RoleSwitchError::StatusUnavailable(format!("no device reported for '{resource}'"))
        })
    }
}
