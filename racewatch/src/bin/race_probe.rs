//! Race observation probe.
//!
//! Flips a shared two-field value while a one-shot `SIGALRM` timer samples it,
//! then prints `PPID=.., PID=.., STATS={..}` unless `SIGUSR2` closed the gate.

use std::io;

use clap::Parser;
use nix::unistd::getpid;
use tracing::warn;

use racewatch::config::{
    DEFAULT_INTERVAL_US, DEFAULT_REPETITIONS, INTERVAL_ENV, ProbeSettings, REPETITIONS_ENV,
};
use racewatch::console::write_line;
use racewatch::exit_codes;
use racewatch::logging;
use racewatch::probe::run_probe;

#[derive(Parser)]
#[command(
    name = "race-probe",
    version,
    about = "Sample a non-atomic pair under timer preemption"
)]
struct Cli {
    /// Number of timer samples before reporting.
    #[arg(long, env = REPETITIONS_ENV, default_value_t = DEFAULT_REPETITIONS)]
    repetitions: u64,

    /// One-shot timer delay between samples, in microseconds.
    #[arg(long, env = INTERVAL_ENV, default_value_t = DEFAULT_INTERVAL_US)]
    interval_us: u64,

    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if !cli.extra.is_empty()
        && let Err(err) = write_line(
            &mut io::stderr(),
            &format!("PROBE [{}]: Warning: Received unexpected arguments.", getpid()),
        )
    {
        warn!(err = %err, "failed to write argument warning");
    }

    let settings = ProbeSettings {
        repetitions: cli.repetitions,
        interval_us: cli.interval_us,
    };
    if let Err(err) = run_probe(&settings) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::FAILURE);
    }
}
