// src/core/controller/promotion.rs

//! Promotion Controller.
//!
//! `Start -> CheckRole -> (AlreadyPrimary | SafetyChecks) -> Promoting -> Promoted
//!  -> MountingFilesystem -> StartingServices -> Verifying`
//!
//! The promote command is issued at most once and never with a forcing flag. Any
//! doubt about the peer's role before that point aborts the run.

use super::{TransitionContext, TransitionOutcome, outcome_for, verdict};
use crate::core::errors::ErrorKind;
use crate::core::status::{ConnectionState, DiskState, ResourceStatus, Role};
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
enum PromotionState {
    Start,
    CheckRole(ResourceStatus),
    AlreadyPrimary,
    SafetyChecks(ResourceStatus),
    Promoting,
    Promoted,
    MountingFilesystem,
    StartingServices(PathBuf),
    Verifying(PathBuf),
}

impl PromotionState {
    fn name(&self) -> &'static str {
        match self {
            PromotionState::Start => "Start",
            PromotionState::CheckRole(_) => "CheckRole",
            PromotionState::AlreadyPrimary => "AlreadyPrimary",
            PromotionState::SafetyChecks(_) => "SafetyChecks",
            PromotionState::Promoting => "Promoting",
            PromotionState::Promoted => "Promoted",
            PromotionState::MountingFilesystem => "MountingFilesystem",
            PromotionState::StartingServices(_) => "StartingServices",
            PromotionState::Verifying(_) => "Verifying",
        }
    }
}

enum Step {
    Next(PromotionState),
    Done(TransitionOutcome),
}

fn abort(reason: impl Into<String>) -> Step {
    let reason = reason.into();
    error!("Promotion aborted as unsafe: {}", reason);
    Step::Done(TransitionOutcome::AbortedUnsafe(reason))
}

fn fail(reason: impl Into<String>) -> Step {
    let reason = reason.into();
    error!("Promotion failed: {}", reason);
    Step::Done(TransitionOutcome::Failed(reason))
}

/// Ends the run on an error, classified by its kind and whether anything was mutated.
fn conclude(kind: ErrorKind, mutated: bool, reason: impl Into<String>) -> Step {
    match outcome_for(kind, mutated, reason.into()) {
        TransitionOutcome::AbortedUnsafe(reason) => abort(reason),
        TransitionOutcome::Failed(reason) => fail(reason),
        other => Step::Done(other),
    }
}

/// Checks whether the observed peer state permits promotion. `Err` carries the refusal reason.
pub fn check_peer_safety(status: &ResourceStatus) -> Result<(), String> {
    // Highest priority, independent of the connection state.
    if status.peer_role == Role::Primary {
        return Err(format!(
            "peer of '{}' is Primary; promoting would create two primaries",
            status.resource
        ));
    }
    if status.peer_role == Role::Unknown {
        match status.connection {
            ConnectionState::Connected => {
                return Err(format!(
                    "'{}' is Connected but the peer role is Unknown; refusing to trust the read",
                    status.resource
                ));
            }
            ConnectionState::StandAlone
            | ConnectionState::Unconnected
            | ConnectionState::Connecting => {
                warn!(
                    "Peer of '{}' is unreachable (connection {}) and its role is Unknown. \
                     Proceeding without fencing (degraded but permitted). Forced promotion \
                     remains a manual operation.",
                    status.resource, status.connection
                );
            }
            ConnectionState::Disconnecting | ConnectionState::Unknown => {
                return Err(format!(
                    "peer role of '{}' is Unknown and connection state is {}",
                    status.resource, status.connection
                ));
            }
        }
    }
    Ok(())
}

/// Checks whether the local disk may become primary. `Err` carries the refusal reason.
pub fn check_disk_safety(status: &ResourceStatus) -> Result<(), String> {
    match status.disk_state {
        DiskState::UpToDate => Ok(()),
        other => Err(format!(
            "local disk of '{}' is {}; refusing to promote",
            status.resource, other
        )),
    }
}

/// Drives one promotion attempt. Callers hold the execution lock.
#[derive(Clone)]
pub struct PromotionController {
    ctx: TransitionContext,
}

impl PromotionController {
    pub fn new(ctx: TransitionContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> TransitionOutcome {
        let resource = &self.ctx.resource;
        info!("Promotion of '{}' requested.", resource);

        let mut state = PromotionState::Start;
        loop {
            let from = state.name();
            match self.step(state).await {
                Step::Next(next) => {
                    debug!("promotion '{}': {} -> {}", resource, from, next.name());
                    state = next;
                }
                Step::Done(outcome) => {
                    debug!("promotion '{}': {} -> {}", resource, from, outcome);
                    return outcome;
                }
            }
        }
    }

    async fn step(&self, state: PromotionState) -> Step {
        let ctx = &self.ctx;
        let resource = ctx.resource.as_str();

        match state {
            PromotionState::Start => match ctx.reader.read(resource).await {
                Ok(status) => {
                    info!("Current state: {}", status);
                    Step::Next(PromotionState::CheckRole(status))
                }
                Err(e) => conclude(e.kind(), false, format!("cannot read status of '{resource}': {e}")),
            },

            PromotionState::CheckRole(status) => {
                if let Err(reason) = check_peer_safety(&status) {
                    return abort(reason);
                }
                match status.local_role {
                    Role::Primary => Step::Next(PromotionState::AlreadyPrimary),
                    Role::Secondary => Step::Next(PromotionState::SafetyChecks(status)),
                    Role::Unknown => abort(format!("local role of '{resource}' is Unknown")),
                }
            }

            PromotionState::AlreadyPrimary => {
                info!("'{}' is already Primary; checking mount and services.", resource);
                let device = ctx.resolve_device().await;
                let mounted = match ctx.sequencer.current_source().await {
                    Ok(source) => source.is_some() && source == device,
                    Err(e) => {
                        return conclude(
                            e.kind(),
                            true,
                            format!("node is Primary but the mount cannot be inspected: {e}"),
                        );
                    }
                };
                let active = match ctx.host.services.is_active(ctx.sequencer.export_service()).await {
                    Ok(active) => active,
                    Err(e) => {
                        return conclude(
                            e.kind(),
                            true,
                            format!("node is Primary but the export service cannot be queried: {e}"),
                        );
                    }
                };
                if mounted && active {
                    info!("'{}' is Primary with filesystem mounted and exports served.", resource);
                    return Step::Done(TransitionOutcome::AlreadyInTargetRole);
                }
                warn!(
                    "'{}' is Primary but incomplete (mounted: {}, export service active: {}); repairing.",
                    resource, mounted, active
                );
                Step::Next(PromotionState::MountingFilesystem)
            }

            PromotionState::SafetyChecks(status) => {
                let status = match self.await_sync(status).await {
                    Ok(status) => status,
                    Err(reason) => return abort(reason),
                };
                if let Err(reason) = check_peer_safety(&status) {
                    return abort(reason);
                }
                if let Err(reason) = check_disk_safety(&status) {
                    return abort(reason);
                }
                info!("Safety checks passed for '{}': {}", resource, status);
                Step::Next(PromotionState::Promoting)
            }

            PromotionState::Promoting => {
                info!("Promoting '{}' to Primary.", resource);
                let Err(e) = ctx.host.replication.promote(resource).await else {
                    return Step::Next(PromotionState::Promoted);
                };
                warn!("Promote command for '{}' failed: {}; re-reading status.", resource, e);
                match ctx.reader.read(resource).await {
                    Ok(status) if status.peer_role == Role::Primary => abort(format!(
                        "promote failed ({e}) and the peer is Primary. MANUAL INTERVENTION \
                         REQUIRED: determine which node holds valid data before any forced \
                         promotion of '{resource}'"
                    )),
                    Ok(status) => match e.kind().settle(status.local_role == Role::Primary) {
                        ErrorKind::Converged => {
                            warn!(
                                "'{}' is Primary despite the reported failure; treating as converged.",
                                resource
                            );
                            Step::Next(PromotionState::Promoted)
                        }
                        kind => conclude(
                            kind,
                            true,
                            format!("promote command failed ({e}); status is now {status}"),
                        ),
                    },
                    Err(read_err) => conclude(
                        read_err.kind(),
                        true,
                        format!("promote command failed ({e}) and status is unavailable ({read_err})"),
                    ),
                }
            }

            PromotionState::Promoted => {
                info!("'{}' promoted to Primary.", resource);
                Step::Next(PromotionState::MountingFilesystem)
            }

            PromotionState::MountingFilesystem => match ctx.sequencer.mount(resource).await {
                Ok(device) => Step::Next(PromotionState::StartingServices(device)),
                Err(e) => conclude(e.kind(), true, format!(
                    "'{resource}' is Primary but the filesystem could not be mounted: {e}. \
                     Mount it manually or demote the node"
                )),
            },

            PromotionState::StartingServices(device) => {
                match ctx.sequencer.start_services().await {
                    Ok(()) => Step::Next(PromotionState::Verifying(device)),
                    Err(e) => conclude(e.kind(), true, format!(
                        "'{resource}' is Primary and mounted but exports could not be started: {e}. \
                         Start the export stack manually"
                    )),
                }
            }

            PromotionState::Verifying(device) => {
                let outcome = verdict(ctx.verify_primary(Some(&device)).await);
                match &outcome {
                    TransitionOutcome::Succeeded => info!("Promotion of '{}' verified.", resource),
                    other => error!("Promotion of '{}' not verified: {}", resource, other),
                }
                Step::Done(outcome)
            }
        }
    }

    /// Waits for an in-progress resync up to the configured bound, re-checking peer
    /// safety on every poll. Reaching the bound is not an error.
    async fn await_sync(&self, mut status: ResourceStatus) -> Result<ResourceStatus, String> {
        let ctx = &self.ctx;
        let resource = ctx.resource.as_str();
        let deadline = Instant::now() + ctx.promotion.sync_wait;

        while status.is_syncing() {
            if Instant::now() >= deadline {
                warn!(
                    "Resync of '{}' still at {:.1}% after {:?}; proceeding without full sync.",
                    resource,
                    status.sync_percent.unwrap_or_default(),
                    ctx.promotion.sync_wait
                );
                break;
            }
            info!(
                "Waiting for resync of '{}' ({:.1}%).",
                resource,
                status.sync_percent.unwrap_or_default()
            );
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(ctx.promotion.sync_poll_interval.min(remaining)).await;

            status = ctx
                .reader
                .read(resource)
                .await
                .map_err(|e| format!("status unavailable while waiting for resync: {e}"))?;
            check_peer_safety(&status)?;
        }
        Ok(status)
    }
}
