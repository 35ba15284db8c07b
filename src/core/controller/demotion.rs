// src/core/controller/demotion.rs

//! Demotion Controller.
//!
//! `Start -> CheckRole -> (AlreadySecondaryAndClean | ProceedCleanup) -> StoppingServices
//!  -> Unmounting -> Demoting -> Verifying`
//!
//! A node that is already Secondary but still has the export service or the mount
//! active goes through the cleanup steps without a role change.

use super::{TransitionContext, TransitionOutcome, outcome_for, verdict};
use crate::core::errors::ErrorKind;
use crate::core::status::{ConnectionState, ResourceStatus, Role};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
enum DemotionState {
    Start,
    CheckRole(ResourceStatus),
    ProceedCleanup { demote: bool },
    StoppingServices { demote: bool },
    Unmounting { demote: bool },
    Demoting,
    Verifying,
}

impl DemotionState {
    fn name(&self) -> &'static str {
        match self {
            DemotionState::Start => "Start",
            DemotionState::CheckRole(_) => "CheckRole",
            DemotionState::ProceedCleanup { .. } => "ProceedCleanup",
            DemotionState::StoppingServices { .. } => "StoppingServices",
            DemotionState::Unmounting { .. } => "Unmounting",
            DemotionState::Demoting => "Demoting",
            DemotionState::Verifying => "Verifying",
        }
    }
}

enum Step {
    Next(DemotionState),
    Done(TransitionOutcome),
}

fn abort(reason: impl Into<String>) -> Step {
    let reason = reason.into();
    error!("Demotion aborted as unsafe: {}", reason);
    Step::Done(TransitionOutcome::AbortedUnsafe(reason))
}

fn fail(reason: impl Into<String>) -> Step {
    let reason = reason.into();
    error!("Demotion failed: {}", reason);
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

/// Per-run facts accumulated while the state machine advances.
struct DemotionRun {
    /// The most recent definite peer role observed during this run.
    last_known_peer: Role,
    device: Option<PathBuf>,
}

impl DemotionRun {
    fn observe(&mut self, status: &ResourceStatus) {
        if status.peer_role != Role::Unknown {
            self.last_known_peer = status.peer_role;
        }
    }

    /// Refuses to give up the primary role while disconnected from a peer last seen as Primary.
    fn check_peer_reachability(&self, status: &ResourceStatus) -> Result<(), String> {
        if status.connection != ConnectionState::Connected && self.last_known_peer == Role::Primary
        {
            return Err(format!(
                "'{}' is {} and the peer was last seen as Primary; refusing to demote \
                 until the peer's state is confirmed",
                status.resource, status.connection
            ));
        }
        Ok(())
    }
}

/// Drives one demotion attempt. Callers hold the execution lock.
#[derive(Clone)]
pub struct DemotionController {
    ctx: TransitionContext,
}

impl DemotionController {
    pub fn new(ctx: TransitionContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> TransitionOutcome {
        let resource = &self.ctx.resource;
        info!("Demotion of '{}' requested.", resource);

        let mut run = DemotionRun {
            last_known_peer: Role::Unknown,
            device: None,
        };
        let mut state = DemotionState::Start;
        loop {
            let from = state.name();
            match self.step(&mut run, state).await {
                Step::Next(next) => {
                    debug!("demotion '{}': {} -> {}", resource, from, next.name());
                    state = next;
                }
                Step::Done(outcome) => {
                    debug!("demotion '{}': {} -> {}", resource, from, outcome);
                    return outcome;
                }
            }
        }
    }

    async fn step(&self, run: &mut DemotionRun, state: DemotionState) -> Step {
        let ctx = &self.ctx;
        let resource = ctx.resource.as_str();

        match state {
            DemotionState::Start => match ctx.reader.read(resource).await {
                Ok(status) => {
                    info!("Current state: {}", status);
                    run.observe(&status);
                    Step::Next(DemotionState::CheckRole(status))
                }
                Err(e) => conclude(e.kind(), false, format!("cannot read status of '{resource}': {e}")),
            },

            DemotionState::CheckRole(status) => match status.local_role {
                Role::Primary => {
                    if let Err(reason) = run.check_peer_reachability(&status) {
                        return abort(reason);
                    }
                    Step::Next(DemotionState::ProceedCleanup { demote: true })
                }
                Role::Secondary => {
                    let mount_point = ctx.sequencer.mount_point();
                    let mounted = match ctx.host.filesystem.is_mounted(mount_point).await {
                        Ok(mounted) => mounted,
                        Err(e) => {
                            return conclude(
                                e.kind(),
                                false,
                                format!("cannot inspect {}: {e}", mount_point.display()),
                            );
                        }
                    };
                    let export = ctx.sequencer.export_service();
                    let active = match ctx.host.services.is_active(export).await {
                        Ok(active) => active,
                        Err(e) => {
                            return conclude(e.kind(), false, format!("cannot query '{export}': {e}"));
                        }
                    };
                    if !mounted && !active {
                        info!("'{}' is already Secondary and clean.", resource);
                        return Step::Done(TransitionOutcome::AlreadyInTargetRole);
                    }
                    warn!(
                        "'{}' is Secondary but not clean (mounted: {}, export service active: {}); cleaning up.",
                        resource, mounted, active
                    );
                    Step::Next(DemotionState::ProceedCleanup { demote: false })
                }
                Role::Unknown => abort(format!("local role of '{resource}' is Unknown")),
            },

            DemotionState::ProceedCleanup { demote } => {
                run.device = ctx.resolve_device().await;
                Step::Next(DemotionState::StoppingServices { demote })
            }

            DemotionState::StoppingServices { demote } => {
                match ctx.sequencer.stop_services().await {
                    Ok(()) => Step::Next(DemotionState::Unmounting { demote }),
                    Err(e) => conclude(e.kind(), true, format!(
                        "cannot guarantee the export service is stopped: {e}. \
                         '{resource}' keeps its role; stop the export stack manually"
                    )),
                }
            }

            DemotionState::Unmounting { demote } => {
                match ctx.sequencer.unmount(run.device.as_deref()).await {
                    Ok(()) if demote => Step::Next(DemotionState::Demoting),
                    Ok(()) => Step::Next(DemotionState::Verifying),
                    Err(e) => conclude(e.kind(), true, format!(
                        "cannot guarantee the filesystem is unmounted: {e}. \
                         Exports are stopped; '{resource}' keeps its role"
                    )),
                }
            }

            DemotionState::Demoting => {
                // Re-evaluate reachability right before giving up the role. Exports and
                // the mount are already gone, so any refusal here is a partial failure.
                match ctx.reader.read(resource).await {
                    Ok(status) => {
                        run.observe(&status);
                        if status.local_role == Role::Secondary {
                            warn!("'{}' became Secondary before the demote command.", resource);
                            return Step::Next(DemotionState::Verifying);
                        }
                        if let Err(reason) = run.check_peer_reachability(&status) {
                            return fail(format!(
                                "{reason}. Exports are stopped and the filesystem is unmounted; \
                                 '{resource}' is still Primary"
                            ));
                        }
                    }
                    Err(e) => {
                        return conclude(
                            e.kind(),
                            true,
                            format!(
                                "status unavailable before demote: {e}. Exports are stopped and \
                                 the filesystem is unmounted; '{resource}' is still Primary"
                            ),
                        );
                    }
                }

                info!("Demoting '{}' to Secondary.", resource);
                let Err(e) = ctx.host.replication.demote(resource).await else {
                    return Step::Next(DemotionState::Verifying);
                };
                warn!("Demote command for '{}' failed: {}; re-reading role.", resource, e);
                match ctx.reader.read_role(resource).await {
                    Ok(role) => match e.kind().settle(role == Role::Secondary) {
                        ErrorKind::Converged => {
                            warn!(
                                "'{}' is Secondary despite the reported failure; treating as converged.",
                                resource
                            );
                            Step::Next(DemotionState::Verifying)
                        }
                        kind => conclude(
                            kind,
                            true,
                            format!(
                                "demote command failed ({e}) and '{resource}' is still {role} with \
                                 exports stopped and the filesystem unmounted. MANUAL INTERVENTION \
                                 REQUIRED: find what holds the device open, then run the demote again"
                            ),
                        ),
                    },
                    Err(read_err) => conclude(
                        read_err.kind(),
                        true,
                        format!("demote command failed ({e}) and the role cannot be read ({read_err})"),
                    ),
                }
            }

            DemotionState::Verifying => {
                let outcome = verdict(ctx.verify_secondary().await);
                match &outcome {
                    TransitionOutcome::Succeeded => info!("Demotion of '{}' verified.", resource),
                    other => error!("Demotion of '{}' not verified: {}", resource, other),
                }
                Step::Done(outcome)
            }
        }
    }
}
