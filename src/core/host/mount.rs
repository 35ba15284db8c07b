// src/core/host/mount.rs

//! util-linux backed filesystem operations (`findmnt`, `mount`, `umount`, `blkid`, `fuser`).

use super::{Filesystem, OpenHandle, UnmountMode};
use crate::core::errors::Result;
use crate::core::exec::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct HostFilesystem {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl HostFilesystem {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(program, args, self.timeout).await
    }

    /// Runs a query whose exit code 1 means "nothing found".
    async fn query_lines(&self, program: &str, args: &[&str]) -> Result<Vec<String>> {
        let output = self.run(program, args).await?;
        if output.code == Some(1) {
            return Ok(Vec::new());
        }
        let output = output.into_result(program)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl Filesystem for HostFilesystem {
    async fn device_exists(&self, device: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(device).await?)
    }

    async fn probe_fs_type(&self, device: &Path) -> Result<Option<String>> {
        let dev = device.to_string_lossy();
        let output = self.run("blkid", &["-o", "value", "-s", "TYPE", &dev]).await?;
        // blkid exits 2 when no recognisable signature is found.
        if output.code == Some(2) {
            return Ok(None);
        }
        let fs_type = output.into_result("blkid")?.stdout.trim().to_string();
        Ok((!fs_type.is_empty()).then_some(fs_type))
    }

    async fn canonical_device(&self, device: &Path) -> Result<PathBuf> {
        Ok(tokio::fs::canonicalize(device).await?)
    }

    async fn mount_source(&self, mount_point: &Path) -> Result<Option<PathBuf>> {
        let mp = mount_point.to_string_lossy();
        let lines = self
            .query_lines("findmnt", &["-n", "-o", "SOURCE", "--mountpoint", &mp])
            .await?;
        Ok(lines.into_iter().next().map(PathBuf::from))
    }

    async fn device_mount_points(&self, device: &Path) -> Result<Vec<PathBuf>> {
        let dev = device.to_string_lossy();
        let lines = self
            .query_lines("findmnt", &["-n", "-o", "TARGET", "--source", &dev])
            .await?;
        Ok(lines.into_iter().map(PathBuf::from).collect())
    }

    async fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: Option<&str>,
    ) -> Result<()> {
        let dev = device.to_string_lossy();
        let mp = mount_point.to_string_lossy();
        let mut args = vec!["-t", fs_type];
        if let Some(opts) = options {
            args.extend(["-o", opts]);
        }
        args.extend([&*dev, &*mp]);
        self.run("mount", &args).await?.into_result("mount").map(|_| ())
    }

    async fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> Result<()> {
        let mp = mount_point.to_string_lossy();
        let mp: &str = &mp;
        let args: Vec<&str> = match mode {
            UnmountMode::Normal => vec![mp],
            UnmountMode::Lazy => vec!["-l", mp],
            UnmountMode::Force => vec!["-f", mp],
        };
        self.run("umount", &args).await?.into_result("umount").map(|_| ())
    }

    async fn open_handles(&self, mount_point: &Path) -> Result<Vec<OpenHandle>> {
        let mp = mount_point.to_string_lossy();
        let output = self.run("fuser", &["-m", &mp]).await?;
        // fuser exits 1 when no process uses the mount.
        if output.code == Some(1) {
            return Ok(Vec::new());
        }
        let output = output.into_result("fuser")?;

        let mut handles = Vec::new();
        for pid in parse_fuser_pids(&output.stdout) {
            let command = tokio::fs::read_to_string(format!("/proc/{pid}/comm"))
                .await
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "?".to_string());
            handles.push(OpenHandle { pid, command });
        }
        Ok(handles)
    }
}

/// Extracts pids from `fuser -m` output, where each pid may carry access-type
/// suffixes such as `1234c` or `88e`.
pub fn parse_fuser_pids(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|token| {
            let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}
