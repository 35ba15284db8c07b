// src/core/status/reader.rs

//! Resource Status Reader: queries the replication subsystem and returns a typed snapshot.

use super::parser::{parse_drbdadm_status, parse_proc_drbd, parse_role_output};
use super::{ResourceStatus, Role};
use crate::core::errors::{Result, RoleSwitchError};
use crate::core::host::{RawStatus, ReplicationControl, StatusFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reads resource status with a hard deadline. Has no side effects.
#[derive(Clone)]
pub struct StatusReader {
    replication: Arc<dyn ReplicationControl>,
    timeout: Duration,
}

impl StatusReader {
    pub fn new(replication: Arc<dyn ReplicationControl>, timeout: Duration) -> Self {
        Self {
            replication,
            timeout,
        }
    }

    /// Reads and parses the current status of `resource`.
    ///
    /// Fails with `ResourceNotFound` when the subsystem does not know the resource and
    /// with `StatusUnavailable` when the query fails or exceeds the deadline.
    pub async fn read(&self, resource: &str) -> Result<ResourceStatus> {
        let raw = self
            .bounded(resource, self.replication.query_status(resource))
            .await?;

        let status = parse_raw(resource, &raw);
        if !status.resource_exists {
            return Err(RoleSwitchError::ResourceNotFound(resource.to_string()));
        }
        debug!("status read: {}", status);
        Ok(status)
    }

    /// Queries only the local role of `resource`.
    pub async fn read_role(&self, resource: &str) -> Result<Role> {
        let text = self
            .bounded(resource, self.replication.query_role(resource))
            .await?;
        let (local, _) = parse_role_output(&text);
        debug!("role read for '{}': {}", resource, local);
        Ok(local)
    }

    async fn bounded<T>(
        &self,
        resource: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RoleSwitchError::ResourceNotFound(r))) => {
                Err(RoleSwitchError::ResourceNotFound(r))
            }
            Ok(Err(e)) => Err(RoleSwitchError::StatusUnavailable(format!(
                "status query for '{resource}' failed: {e}"
            ))),
            Err(_) => Err(RoleSwitchError::StatusUnavailable(format!(
                "status query for '{resource}' exceeded {:?}",
                self.timeout
            ))),
        }
    }
}

/// Dispatches raw status text to the parser for its format.
pub fn parse_raw(resource: &str, raw: &RawStatus) -> ResourceStatus {
    match raw.format {
        StatusFormat::DrbdAdm => parse_drbdadm_status(resource, &raw.text),
        StatusFormat::Proc { minor } => parse_proc_drbd(resource, minor, &raw.text),
    }
}
