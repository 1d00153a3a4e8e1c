//! Signal handlers bound to the process-wide probe store.
//!
//! Handlers receive no context, so the store lives in a `static`. They call
//! into [`SharedPairStore`] methods that only perform fixed-size atomic loads
//! and stores.

use std::ffi::c_int;

use anyhow::{Context, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::probe::store::SharedPairStore;

/// Store shared by the spin loop and the handlers of this process.
pub static PROBE_STORE: SharedPairStore = SharedPairStore::new();

/// Control signal that opens the output gate.
pub const ENABLE_OUTPUT: Signal = Signal::SIGUSR1;
/// Control signal that closes the output gate.
pub const DISABLE_OUTPUT: Signal = Signal::SIGUSR2;

extern "C" fn on_timer_expired(_signal: c_int) {
    PROBE_STORE.record_sample();
}

extern "C" fn on_gate_signal(signal: c_int) {
    if signal == ENABLE_OUTPUT as c_int {
        PROBE_STORE.set_output(true);
    } else if signal == DISABLE_OUTPUT as c_int {
        PROBE_STORE.set_output(false);
    }
}

/// Install the `SIGALRM` sampler and the `SIGUSR1`/`SIGUSR2` gate.
///
/// `SIGALRM` is blocked while its own handler runs. The gate signals block each
/// other and restart interrupted syscalls.
#[allow(unsafe_code)]
pub fn install_probe_handlers() -> Result<()> {
    let mut timer_mask = SigSet::empty();
    timer_mask.add(Signal::SIGALRM);
    let timer = SigAction::new(
        SigHandler::Handler(on_timer_expired),
        SaFlags::empty(),
        timer_mask,
    );

    let mut gate_mask = SigSet::empty();
    gate_mask.add(ENABLE_OUTPUT);
    gate_mask.add(DISABLE_OUTPUT);
    let gate = SigAction::new(
        SigHandler::Handler(on_gate_signal),
        SaFlags::SA_RESTART,
        gate_mask,
    );

    // SAFETY: both handlers only touch atomics in PROBE_STORE; no allocation,
    // locking or I/O happens inside them.
    unsafe {
        sigaction(Signal::SIGALRM, &timer).context("install SIGALRM handler")?;
        sigaction(ENABLE_OUTPUT, &gate).context("install SIGUSR1 handler")?;
        sigaction(DISABLE_OUTPUT, &gate).context("install SIGUSR2 handler")?;
    }
    Ok(())
}
