// src/core/mod.rs

//! The role transition core: status inspection, locking, service sequencing,
//! and the promotion/demotion state machines.

pub mod controller;
pub mod coordinator;
pub mod errors;
pub mod exec;
pub mod host;
pub mod lock;
pub mod retry;
pub mod sequencer;
pub mod status;

pub use controller::TransitionOutcome;
pub use coordinator::{Coordinator, Direction};
pub use errors::RoleSwitchError;
pub use status::ResourceStatus;
