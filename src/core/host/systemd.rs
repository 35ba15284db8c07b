// src/core/host/systemd.rs

//! `systemctl`-backed service management.

use super::{KillSignal, ServiceManager};
use crate::core::errors::{Result, RoleSwitchError};
use crate::core::exec::CommandRunner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const SYSTEMCTL: &str = "systemctl";
const PKILL: &str = "pkill";
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Systemd {
    runner: Arc<dyn CommandRunner>,
    /// Upper bound for a single start job.
    job_timeout: Duration,
}

impl Systemd {
    pub fn new(runner: Arc<dyn CommandRunner>, job_timeout: Duration) -> Self {
        Self {
            runner,
            job_timeout,
        }
    }

    async fn systemctl(&self, args: &[&str], timeout: Duration) -> Result<()> {
        self.runner
            .run(SYSTEMCTL, args, timeout)
            .await?
            .into_result(SYSTEMCTL)
            .map(|_| ())
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn is_active(&self, service: &str) -> Result<bool> {
        // `is-active` exits non-zero for every state but "active"; the exit code is the answer.
        let output = self
            .runner
            .run(SYSTEMCTL, &["is-active", "--quiet", service], QUERY_TIMEOUT)
            .await?;
        Ok(output.success())
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.systemctl(&["start", service], self.job_timeout)
            .await
            .map_err(|e| RoleSwitchError::ServiceStartFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })
    }

    /// Queues the stop job and returns; callers poll `is_active` against their own deadline.
    async fn stop(&self, service: &str) -> Result<()> {
        self.systemctl(&["stop", "--no-block", service], QUERY_TIMEOUT).await
    }

    async fn kill(&self, service: &str, signal: KillSignal) -> Result<()> {
        self.systemctl(
            &["kill", "--signal", signal.as_str(), service],
            QUERY_TIMEOUT,
        )
        .await
    }

    async fn kill_residual(&self, process: &str) -> Result<bool> {
        let output = self
            .runner
            .run(PKILL, &["-KILL", "-x", process], QUERY_TIMEOUT)
            .await?;
        // pkill: 0 = something matched, 1 = nothing matched, anything else is an error.
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => output.into_result(PKILL).map(|_| false),
        }
    }
}
