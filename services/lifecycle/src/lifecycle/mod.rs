//! Lifecycle controller and the reboot monitor state machine.

mod controller;
mod reboot;

pub use controller::{IdleAction, LifecycleController, TickOutcome};
pub use reboot::{
    AbandonReason, Observation, RebootPolicy, RebootSession, SessionPhase, Step,
};
