//! One-shot `SIGALRM` timer that drives probe sampling.

use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SigEvent, SigevNotify, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;

/// A timer that fires exactly once per `arm` call.
///
/// The loop rearms only after the previous expiration was handled, so each
/// repetition sees at most one sample.
pub trait OneShotTimer {
    fn arm(&mut self, interval: Duration) -> Result<()>;
}

/// POSIX timer delivering `SIGALRM` to this process.
pub struct AlarmTimer {
    timer: Timer,
}

impl AlarmTimer {
    pub fn new() -> Result<Self> {
        let event = SigEvent::new(SigevNotify::SigevSignal {
            signal: Signal::SIGALRM,
            si_value: 0,
        });
        let timer = Timer::new(ClockId::CLOCK_MONOTONIC, event).context("create SIGALRM timer")?;
        Ok(Self { timer })
    }
}

impl OneShotTimer for AlarmTimer {
    fn arm(&mut self, interval: Duration) -> Result<()> {
        self.timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(interval)),
                TimerSetTimeFlags::empty(),
            )
            .context("arm one-shot timer")
    }
}
