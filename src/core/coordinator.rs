// src/core/coordinator.rs

//! Wraps a controller run with the execution lock and interrupt handling.
//!
//! Interrupt handlers are registered before the lock is taken, and the lock is
//! released on every path out of a run: success, abort, failure, or signal.

use crate::config::Config;
use crate::core::controller::{
    DemotionController, PromotionController, TransitionContext, TransitionOutcome, outcome_for,
};
use crate::core::errors::RoleSwitchError;
use crate::core::host::Host;
use crate::core::lock::ExecutionLock;
use std::fmt;
use std::future::Future;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Promote,
    Demote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Promote => write!(f, "promotion"),
            Direction::Demote => write!(f, "demotion"),
        }
    }
}

pub struct Coordinator {
    ctx: TransitionContext,
    lock: ExecutionLock,
}

impl Coordinator {
    pub fn new(config: &Config, host: Host) -> Self {
        Self {
            ctx: TransitionContext::new(config, host),
            lock: ExecutionLock::new(&config.lock),
        }
    }

    pub fn context(&self) -> &TransitionContext {
        &self.ctx
    }

    pub async fn promote(&self) -> TransitionOutcome {
        self.run(Direction::Promote).await
    }

    pub async fn demote(&self) -> TransitionOutcome {
        self.run(Direction::Demote).await
    }

    /// Runs one transition, cancelled by SIGINT or SIGTERM.
    pub async fn run(&self, direction: Direction) -> TransitionOutcome {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                return TransitionOutcome::AbortedUnsafe(format!(
                    "cannot register SIGINT handler: {e}"
                ));
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                return TransitionOutcome::AbortedUnsafe(format!(
                    "cannot register SIGTERM handler: {e}"
                ));
            }
        };
        let interrupted = async {
            tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        };
        self.run_until(direction, interrupted).await
    }

    /// Runs one transition, cancelled when `interrupt` completes. The future yields
    /// the name of whatever interrupted the run.
    pub async fn run_until<F>(&self, direction: Direction, interrupt: F) -> TransitionOutcome
    where
        F: Future<Output = &'static str>,
    {
        let resource = self.ctx.resource.as_str();
        let started = Instant::now();
        tokio::pin!(interrupt);

        let handle = tokio::select! {
            res = self.lock.acquire(resource) => match res {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Cannot start {} of '{}': {}", direction, resource, e);
                    return outcome_for(e.kind(), false, e.to_string());
                }
            },
            by = &mut interrupt => {
                info!("{} of '{}' cancelled by {} while waiting for the lock.", direction, resource, by);
                let err = RoleSwitchError::Interrupted(by.to_string());
                return outcome_for(err.kind(), false, format!("{err} before start"));
            }
        };

        let outcome = tokio::select! {
            biased;
            by = &mut interrupt => {
                error!(
                    "{} of '{}' interrupted by {}; the node may be partially transitioned.",
                    direction, resource, by
                );
                let err = RoleSwitchError::Interrupted(by.to_string());
                outcome_for(
                    err.kind(),
                    true,
                    format!("{err} during {direction}; inspect the node before retrying"),
                )
            }
            outcome = self.dispatch(direction) => outcome,
        };

        handle.release();
        info!(
            "{} of '{}' finished in {:?}: {}",
            direction,
            resource,
            started.elapsed(),
            outcome
        );
        outcome
    }

    async fn dispatch(&self, direction: Direction) -> TransitionOutcome {
        match direction {
            Direction::Promote => PromotionController::new(self.ctx.clone()).run().await,
            Direction::Demote => DemotionController::new(self.ctx.clone()).run().await,
        }
    }
}
