//! Interactive supervisor: launches probes, tracks them, relays control signals.

pub mod commands;
pub mod control;
pub mod process;
pub mod registry;
pub mod signals;

pub use control::{
    BroadcastTally, KillAllReason, KillAllTally, KillOutcome, Phase, Supervisor,
};
