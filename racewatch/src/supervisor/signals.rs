//! Asynchronous notifications delivered to the supervisor.
//!
//! Two kinds arrive: `SIGCHLD` when a probe exits, and `SIGINT`/`SIGTERM`/
//! `SIGQUIT` asking the supervisor to stop. Their handlers run in a restricted
//! context and therefore only:
//!
//! - drain the OS process table with non-blocking `waitpid`, and
//! - store into `static` atomics.
//!
//! Neither handler touches the [`ChildRegistry`](super::registry::ChildRegistry).
//! Dead entries stay tracked until a kill or broadcast observes `ESRCH`.
//!
//! While a launch is in flight the reaper stands down (see [`LaunchGuard`]):
//! `std::process::Command` waits on a child whose exec failed and must be the
//! one to collect it.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::warn;

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);
static REAP_ANOMALIES: AtomicU64 = AtomicU64::new(0);
static LAST_REAP_ERRNO: AtomicI32 = AtomicI32::new(0);
static LAUNCH_IN_FLIGHT: AtomicBool = AtomicBool::new(false);
static REAP_PENDING: AtomicBool = AtomicBool::new(false);

/// Signals that ask the supervisor to shut down.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Cancellation flag observed by the command loop between blocking reads.
#[derive(Debug, Clone, Copy)]
pub struct TerminationFlag {
    flag: &'static AtomicBool,
}

impl TerminationFlag {
    /// The flag set by this process's termination handler.
    pub fn process() -> Self {
        Self {
            flag: &TERMINATION_REQUESTED,
        }
    }

    /// A flag no handler writes to. Used to drive a supervisor without signals.
    pub fn from_static(flag: &'static AtomicBool) -> Self {
        Self { flag }
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Failures the reaper hit since the last check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapAnomaly {
    pub count: u64,
    pub last_errno: Errno,
}

/// Take the anomalies recorded by the `SIGCHLD` handler, if any.
pub fn take_reap_anomaly() -> Option<ReapAnomaly> {
    let count = REAP_ANOMALIES.swap(0, Ordering::SeqCst);
    (count > 0).then(|| ReapAnomaly {
        count,
        last_errno: Errno::from_raw(LAST_REAP_ERRNO.load(Ordering::SeqCst)),
    })
}

/// Holds the reaper off for the duration of one launch.
///
/// A `SIGCHLD` that arrives meanwhile is remembered and the drain runs when the
/// guard drops, so no exited child is left unreaped.
pub struct LaunchGuard {
    _private: (),
}

impl LaunchGuard {
    pub fn begin() -> Self {
        LAUNCH_IN_FLIGHT.store(true, Ordering::SeqCst);
        Self { _private: () }
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        LAUNCH_IN_FLIGHT.store(false, Ordering::SeqCst);
        if REAP_PENDING.swap(false, Ordering::SeqCst) {
            drain_exited_children();
        }
    }
}

/// Collect every exited child without blocking.
fn drain_exited_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(errno) => {
                LAST_REAP_ERRNO.store(errno as i32, Ordering::SeqCst);
                REAP_ANOMALIES.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }
    }
}

extern "C" fn on_child_terminated(_signal: c_int) {
    let saved_errno = Errno::last_raw();
    if LAUNCH_IN_FLIGHT.load(Ordering::SeqCst) {
        REAP_PENDING.store(true, Ordering::SeqCst);
        // The guard may have dropped between the two operations above.
        if LAUNCH_IN_FLIGHT.load(Ordering::SeqCst) {
            Errno::set_raw(saved_errno);
            return;
        }
        REAP_PENDING.store(false, Ordering::SeqCst);
    }
    drain_exited_children();
    Errno::set_raw(saved_errno);
}

extern "C" fn on_termination_request(_signal: c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the supervisor's handlers.
///
/// Termination signals do not restart syscalls, so a blocking read returns
/// `EINTR` and the loop gets to look at the flag. `SIGCHLD` restarts them and
/// ignores stopped children. The supervisor itself ignores the probe control
/// signals; failing to do so is only a warning.
#[allow(unsafe_code)]
pub fn install_supervisor_handlers() -> Result<()> {
    let termination = SigAction::new(
        SigHandler::Handler(on_termination_request),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let reaper = SigAction::new(
        SigHandler::Handler(on_child_terminated),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the handlers only store into atomics and call waitpid, which is
    // async-signal-safe.
    unsafe {
        for signal in TERMINATION_SIGNALS {
            sigaction(signal, &termination)
                .with_context(|| format!("install {signal} handler"))?;
        }
        sigaction(Signal::SIGCHLD, &reaper).context("install SIGCHLD handler")?;

        for signal in [Signal::SIGUSR1, Signal::SIGUSR2] {
            if let Err(errno) = sigaction(signal, &ignore) {
                warn!(%signal, err = %errno, "failed to ignore probe control signal");
            }
        }
    }
    Ok(())
}
