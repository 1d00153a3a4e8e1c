//! Launch failures while the supervisor's `SIGCHLD` reaper is installed.
//!
//! Kept in its own test binary: installing the handlers changes process-wide
//! signal dispositions for every test that shares the process.

use std::path::Path;

use racewatch::config::ProbeSettings;
use racewatch::supervisor::Supervisor;
use racewatch::supervisor::process::{OsProcesses, ProcessControl};
use racewatch::supervisor::registry::INITIAL_CAPACITY;
use racewatch::supervisor::signals::install_supervisor_handlers;
use racewatch::terminal::DetachedTerminal;
use racewatch::test_support::detached_flag;

const MISSING_PROBE: &str = "/nonexistent/race-probe";

#[test]
fn failed_exec_is_an_error_with_reaper_installed() {
    install_supervisor_handlers().expect("install handlers");
    let mut processes = OsProcesses::new(Path::new(MISSING_PROBE), &ProbeSettings::default());

    for _ in 0..20 {
        let err = processes.launch().unwrap_err();
        assert!(err.to_string().contains("spawn /nonexistent/race-probe"));
    }
}

#[test]
fn supervisor_keeps_running_after_failed_spawn() {
    install_supervisor_handlers().expect("install handlers");
    let processes = OsProcesses::new(Path::new(MISSING_PROBE), &ProbeSettings::default());
    let mut supervisor = Supervisor::new(
        processes,
        DetachedTerminal,
        Vec::new(),
        detached_flag(),
        INITIAL_CAPACITY,
    );

    assert_eq!(supervisor.spawn(), None);
    assert_eq!(supervisor.spawn(), None);
    supervisor.list();

    assert!(supervisor.registry().is_empty());
    let output = String::from_utf8_lossy(supervisor.output()).into_owned();
    assert_eq!(output.matches("Failed to spawn probe").count(), 2);
    assert!(output.contains("Total probes: 0"));
    assert!(output.contains("No tracked probes."));
}
