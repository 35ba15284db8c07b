// src/core/errors.rs

//! Defines the primary error type for the role transition core.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing all failures the core can surface.
/// `std::io::Error` is wrapped in an `Arc` so the whole enum stays cheaply cloneable.
#[derive(Error, Debug, Clone)]
pub enum RoleSwitchError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Resource '{0}' not found in the replication subsystem")]
    ResourceNotFound(String),

    #[error("Status unavailable: {0}")]
    StatusUnavailable(String),

    #[error("Command '{program}' timed out after {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    #[error("Command '{program}' failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Timed out after {waited:?} waiting for the execution lock on '{resource}'")]
    LockTimeout { resource: String, waited: Duration },

    #[error("Service '{service}' could not be started: {reason}")]
    ServiceStartFailed { service: String, reason: String },

    #[error("Service '{0}' could not be stopped")]
    ServiceStopFailed(String),

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("'{0}' is still mounted after all unmount attempts")]
    UnmountFailed(String),

    #[error("Interrupted by {0}")]
    Interrupted(String),
}

/// The failure taxonomy of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition could not be proven. Nothing further may be mutated.
    SafetyAbort,
    /// The subsystem could not be queried or commanded in time. Never assume success.
    SubsystemUnavailable,
    /// A mutating step failed or could not be verified. Never retried with force.
    PartialFailure,
    /// A command reported failure but re-reading showed the desired end state.
    Converged,
}

impl RoleSwitchError {
    /// Classifies the error. `Converged` is never returned here; it is decided by the
    /// controllers after re-reading state, see [`ErrorKind::settle`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoleSwitchError::ResourceNotFound(_)
            | RoleSwitchError::LockTimeout { .. }
            | RoleSwitchError::Interrupted(_) => ErrorKind::SafetyAbort,
            RoleSwitchError::StatusUnavailable(_)
            | RoleSwitchError::CommandTimeout { .. }
            | RoleSwitchError::Io(_) => ErrorKind::SubsystemUnavailable,
            RoleSwitchError::CommandFailed { .. }
            | RoleSwitchError::ServiceStartFailed { .. }
            | RoleSwitchError::ServiceStopFailed(_)
            | RoleSwitchError::MountFailed(_)
            | RoleSwitchError::UnmountFailed(_) => ErrorKind::PartialFailure,
        }
    }
}

impl ErrorKind {
    /// Reclassifies a failed command once the end state has been re-read.
    pub fn settle(self, reached_target: bool) -> ErrorKind {
        if reached_target {
            ErrorKind::Converged
        } else {
            self
        }
    }
}

impl PartialEq for RoleSwitchError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RoleSwitchError::Io(e1), RoleSwitchError::Io(e2)) => e1.to_string() == e2.to_string(),
            (RoleSwitchError::ResourceNotFound(a), RoleSwitchError::ResourceNotFound(b)) => a == b,
            (RoleSwitchError::UnmountFailed(a), RoleSwitchError::UnmountFailed(b)) => a == b,
            (RoleSwitchError::ServiceStopFailed(a), RoleSwitchError::ServiceStopFailed(b)) => {
                a == b
            }
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for RoleSwitchError {
    fn from(e: std::io::Error) -> Self {
        RoleSwitchError::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, RoleSwitchError>;
