//! Race observation probe.
//!
//! A probe runs as its own process: it resets the shared store, installs the
//! timer and gate handlers, spins until the repetition budget is sampled and
//! finally reports (or suppresses) its statistics.
//!
//! ```text
//! INIT → ARMED → (spin) → SAMPLED → ARMED → … → BUDGET_REACHED → REPORTING → DONE
//!                            └── rearm failure ─────────────────→ REPORTING
//! ```

pub mod handlers;
pub mod report;
pub mod run;
pub mod store;
pub mod timer;

use std::io;

use anyhow::{Context, Result};
use nix::unistd::{getpid, getppid};
use tracing::warn;

use crate::config::ProbeSettings;
use crate::console::write_line;
use handlers::{PROBE_STORE, install_probe_handlers};
use report::ProbeReport;
use run::{RunEnd, RunSummary, emit_report};
use timer::AlarmTimer;

/// Run a complete probe lifecycle in this process.
pub fn run_probe(settings: &ProbeSettings) -> Result<RunSummary> {
    settings.validate()?;
    let pid = getpid();
    let parent_pid = getppid();
    let store = &PROBE_STORE;

    store.reset(settings.repetitions);
    install_probe_handlers()?;
    let mut timer = AlarmTimer::new()?;

    // Printed after the handlers are in place so a reader can use it as a
    // readiness marker before sending gate signals.
    write_line(
        &mut io::stderr(),
        &format!(
            "PROBE [{pid}]: Started. PPID={parent_pid}. Output initially {}. Will run {} reps.",
            if store.output_enabled() {
                "ENABLED"
            } else {
                "DISABLED"
            },
            settings.repetitions
        ),
    )
    .context("write start notice")?;

    let summary = run::run(store, settings, &mut timer)?;
    if summary.end == RunEnd::RearmFailed {
        warn!(
            completed = summary.repetitions,
            budget = settings.repetitions,
            "reporting partial statistics"
        );
    }

    let report = ProbeReport {
        parent_pid: parent_pid.as_raw(),
        pid: pid.as_raw(),
        stats: summary.stats,
    };
    emit_report(
        &report,
        store.output_enabled(),
        &mut io::stdout().lock(),
        &mut io::stderr(),
    )
    .context("write final statistics")?;

    write_line(
        &mut io::stderr(),
        &format!("PROBE [{pid}]: Exiting normally."),
    )
    .context("write exit notice")?;
    Ok(summary)
}
