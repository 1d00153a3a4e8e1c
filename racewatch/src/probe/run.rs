//! The probe's alternation loop and final report.

use std::io::{self, Write};

use anyhow::{Result, anyhow};
use tracing::{debug, error, instrument};

use crate::config::ProbeSettings;
use crate::console::write_line;
use crate::probe::report::ProbeReport;
use crate::probe::store::{OutcomeStats, SharedPairStore};
use crate::probe::timer::OneShotTimer;

/// Which edge ended the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Every repetition in the budget was sampled.
    BudgetReached,
    /// The timer could not be rearmed; the counts cover the completed repetitions.
    RearmFailed,
}

/// Summary of one probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub end: RunEnd,
    pub repetitions: u64,
    pub stats: OutcomeStats,
}

/// Flip the shared pair until the timer has sampled it `settings.repetitions` times.
///
/// Each repetition clears the interrupt flag, arms the one-shot timer and spins
/// writing `(0,0)` and `(1,1)` alternately until the handler sets the flag. The
/// spin never yields. A failure to arm the very first sample is returned as an
/// error; later failures end the loop early with the counts gathered so far.
#[instrument(skip_all, fields(budget = settings.repetitions, interval_us = settings.interval_us))]
pub fn run<T: OneShotTimer>(
    store: &SharedPairStore,
    settings: &ProbeSettings,
    timer: &mut T,
) -> Result<RunSummary> {
    let interval = settings.interval();
    let mut value = 0;
    let mut end = RunEnd::BudgetReached;
    store.store_pair(value);

    while !store.budget_reached() {
        store.begin_repetition();
        if let Err(err) = timer.arm(interval) {
            let completed = store.repetitions();
            if completed == 0 {
                return Err(err.context("arm first probe sample"));
            }
            error!(err = %err, completed, "failed to rearm probe timer, stopping early");
            end = RunEnd::RearmFailed;
            break;
        }

        while !store.sampled() {
            store.store_pair(value);
            value ^= 1;
        }
    }

    let stats = store.stats();
    let repetitions = store.repetitions();
    if stats.total() != repetitions {
        return Err(anyhow!(
            "sample count {} does not match completed repetitions {repetitions}",
            stats.total()
        ));
    }
    debug!(repetitions, torn = stats.torn(), ?end, "probe loop finished");
    Ok(RunSummary {
        end,
        repetitions,
        stats,
    })
}

/// Emit the report line if the gate is open, or a suppression notice otherwise.
///
/// Returns whether the report line was written.
pub fn emit_report<O: Write, E: Write>(
    report: &ProbeReport,
    output_enabled: bool,
    out: &mut O,
    err: &mut E,
) -> io::Result<bool> {
    if output_enabled {
        write_line(out, &report.to_string())?;
        Ok(true)
    } else {
        write_line(
            err,
            &format!(
                "PROBE [{}]: Final statistics output suppressed by signal.",
                report.pid
            ),
        )?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::ThreadTimer;

    fn settings(repetitions: u64) -> ProbeSettings {
        ProbeSettings {
            repetitions,
            interval_us: 50,
        }
    }

    #[test]
    fn counts_sum_to_budget() {
        let store = Arc::new(SharedPairStore::new());
        store.reset(101);
        let mut timer = ThreadTimer::new(Arc::clone(&store));

        let summary = run(&store, &settings(101), &mut timer).expect("run");

        assert_eq!(summary.end, RunEnd::BudgetReached);
        assert_eq!(summary.repetitions, 101);
        assert_eq!(summary.stats.total(), 101);
        assert_eq!(timer.armed(), 101);
    }

    #[test]
    fn rearm_failure_keeps_partial_counts() {
        let store = Arc::new(SharedPairStore::new());
        store.reset(50);
        let mut timer = ThreadTimer::new(Arc::clone(&store)).fail_after(10);

        let summary = run(&store, &settings(50), &mut timer).expect("run");

        assert_eq!(summary.end, RunEnd::RearmFailed);
        assert_eq!(summary.repetitions, 10);
        assert_eq!(summary.stats.total(), 10);
    }

    #[test]
    fn first_arm_failure_is_an_error() {
        let store = Arc::new(SharedPairStore::new());
        store.reset(5);
        let mut timer = ThreadTimer::new(Arc::clone(&store)).fail_after(0);

        let err = run(&store, &settings(5), &mut timer).unwrap_err();
        assert!(format!("{err:#}").contains("arm first probe sample"));
    }

    #[test]
    fn open_gate_writes_report_to_primary_channel() {
        let report = ProbeReport {
            parent_pid: 1,
            pid: 2,
            stats: OutcomeStats::new([1, 0, 0, 1]),
        };
        let mut out = Vec::new();
        let mut err = Vec::new();

        let written = emit_report(&report, true, &mut out, &mut err).expect("emit");

        assert!(written);
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "PPID=1, PID=2, STATS={00:1, 01:0, 10:0, 11:1}\r\n"
        );
        assert!(err.is_empty());
    }

    #[test]
    fn closed_gate_writes_notice_to_secondary_channel() {
        let report = ProbeReport {
            parent_pid: 1,
            pid: 2,
            stats: OutcomeStats::default(),
        };
        let mut out = Vec::new();
        let mut err = Vec::new();

        let written = emit_report(&report, false, &mut out, &mut err).expect("emit");

        assert!(!written);
        assert!(out.is_empty());
        assert!(
            String::from_utf8(err)
                .expect("utf8")
                .contains("suppressed by signal")
        );
    }
}
