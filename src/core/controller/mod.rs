// src/core/controller/mod.rs

//! The promotion and demotion state machines and what they share: the run
//! context, the outcome type, and end-state verification.
//!
//! Verification always re-reads the live state. The end state, not the sequence of
//! successful steps, decides whether a run succeeded.

use crate::config::{Config, PromotionSettings};
use crate::core::errors::ErrorKind;
use crate::core::host::Host;
use crate::core::sequencer::ServiceSequencer;
use crate::core::status::{Role, StatusReader};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub mod demotion;
pub mod promotion;

pub use demotion::DemotionController;
pub use promotion::PromotionController;

/// The result of a controller run. Used for reporting and the exit status only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum TransitionOutcome {
    /// The node already held the target role with everything in place. Nothing was changed.
    AlreadyInTargetRole,
    Succeeded,
    /// A safety precondition failed. The role-change command was never issued.
    AbortedUnsafe(String),
    /// A step failed after state may have been mutated. Needs operator attention.
    Failed(String),
}

impl TransitionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TransitionOutcome::AlreadyInTargetRole | TransitionOutcome::Succeeded
        )
    }

    /// The process exit status for the calling scheduler.
    pub fn exit_code(&self) -> i32 {
        match self {
            TransitionOutcome::AlreadyInTargetRole | TransitionOutcome::Succeeded => 0,
            TransitionOutcome::Failed(_) => 1,
            TransitionOutcome::AbortedUnsafe(_) => 2,
        }
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionOutcome::AlreadyInTargetRole => write!(f, "AlreadyInTargetRole"),
            TransitionOutcome::Succeeded => write!(f, "Succeeded"),
            TransitionOutcome::AbortedUnsafe(reason) => write!(f, "AbortedUnsafe: {reason}"),
            TransitionOutcome::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Everything a controller run needs, threaded explicitly through the state machine.
#[derive(Clone)]
pub struct TransitionContext {
    pub resource: String,
    pub host: Host,
    pub reader: StatusReader,
    pub sequencer: ServiceSequencer,
    pub promotion: PromotionSettings,
}

impl TransitionContext {
    pub fn new(config: &Config, host: Host) -> Self {
        Self {
            resource: config.resource.clone(),
            reader: StatusReader::new(host.replication.clone(), config.replication.status_timeout),
            sequencer: ServiceSequencer::new(host.clone(), config),
            promotion: config.promotion.clone(),
            host,
        }
    }

    /// The canonical block device of the resource, if it can be resolved.
    pub async fn resolve_device(&self) -> Option<PathBuf> {
        let device = match self.host.replication.device_path(&self.resource).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Could not resolve the device of '{}': {}", self.resource, e);
                return None;
            }
        };
        match self.host.filesystem.canonical_device(&device).await {
            Ok(canonical) => Some(canonical),
            Err(_) => Some(device),
        }
    }

    /// Compares the live state with the promoted target state and returns every discrepancy.
    pub async fn verify_primary(&self, device: Option<&Path>) -> Vec<String> {
        let mut problems = Vec::new();

        match self.reader.read(&self.resource).await {
            Ok(status) => {
                if status.local_role != Role::Primary {
                    problems.push(format!("local role is {}, expected Primary", status.local_role));
                }
                if status.peer_role == Role::Primary {
                    problems.push("peer also reports Primary".to_string());
                }
            }
            Err(e) => problems.push(format!("could not re-read status: {e}")),
        }

        let mount_point = self.sequencer.mount_point().display().to_string();
        match self.sequencer.current_source().await {
            Ok(Some(source)) => {
                if let Some(device) = device
                    && source != device
                {
                    problems.push(format!(
                        "{mount_point} is backed by {}, expected {}",
                        source.display(),
                        device.display()
                    ));
                }
            }
            Ok(None) => problems.push(format!("{mount_point} is not mounted")),
            Err(e) => problems.push(format!("could not inspect {mount_point}: {e}")),
        }

        let export = self.sequencer.export_service();
        match self.host.services.is_active(export).await {
            Ok(true) => {}
            Ok(false) => problems.push(format!("export service '{export}' is not active")),
            Err(e) => problems.push(format!("could not query '{export}': {e}")),
        }

        problems
    }

    /// Compares the live state with the demoted target state and returns every discrepancy.
    pub async fn verify_secondary(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.reader.read(&self.resource).await {
            Ok(status) if status.local_role == Role::Secondary => {}
            Ok(status) => {
                problems.push(format!("local role is {}, expected Secondary", status.local_role))
            }
            Err(e) => problems.push(format!("could not re-read status: {e}")),
        }

        let mount_point = self.sequencer.mount_point();
        match self.host.filesystem.is_mounted(mount_point).await {
            Ok(false) => {}
            Ok(true) => problems.push(format!("{} is still mounted", mount_point.display())),
            Err(e) => problems.push(format!(
                "could not inspect {}: {e}",
                mount_point.display()
            )),
        }

        let export = self.sequencer.export_service();
        match self.host.services.is_active(export).await {
            Ok(false) => {}
            Ok(true) => problems.push(format!("export service '{export}' is still active")),
            Err(e) => problems.push(format!("could not query '{export}': {e}")),
        }

        problems
    }
}

/// Turns a list of verification discrepancies into an outcome.
pub(crate) fn verdict(problems: Vec<String>) -> TransitionOutcome {
    if problems.is_empty() {
        TransitionOutcome::Succeeded
    } else {
        TransitionOutcome::Failed(format!(
            "final verification failed: {}",
            problems.join("; ")
        ))
    }
}

/// Maps the error that ends a run to its outcome. `mutated` tells whether the run
/// has issued a mutating command or found the node already serving as Primary.
/// Until then only a failed mutating step counts as `Failed`.
pub fn outcome_for(kind: ErrorKind, mutated: bool, reason: String) -> TransitionOutcome {
    match kind {
        ErrorKind::Converged => TransitionOutcome::Succeeded,
        ErrorKind::PartialFailure => TransitionOutcome::Failed(reason),
        ErrorKind::SafetyAbort | ErrorKind::SubsystemUnavailable if mutated => {
            TransitionOutcome::Failed(reason)
        }
        ErrorKind::SafetyAbort | ErrorKind::SubsystemUnavailable => {
            TransitionOutcome::AbortedUnsafe(reason)
        }
    }
}
