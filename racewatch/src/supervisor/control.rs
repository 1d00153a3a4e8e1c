//! The supervisor's command loop and the operations it dispatches to.
//!
//! ```text
//! INIT → RUNNING → SHUTTING_DOWN → TERMINATED
//! ```
//!
//! Every registry mutation happens here, on the main context. The `SIGCHLD`
//! reaper only drains the OS process table, so an exited probe stays tracked
//! until a kill observes `ESRCH` for it.

use std::collections::TryReserveError;
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpid};
use tracing::{debug, error, info, warn};

use crate::console::{LINE_END, write_block, write_line};
use crate::supervisor::commands::{Command, HELP, ProbeSignal};
use crate::supervisor::process::{Delivery, ProcessControl};
use crate::supervisor::registry::ChildRegistry;
use crate::supervisor::signals::{TerminationFlag, take_reap_anomaly};
use crate::terminal::TerminalMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    ShuttingDown,
    Terminated,
}

/// Why `kill_all` runs. Shutdown stays quiet when there is nothing to kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAllReason {
    Command,
    Shutdown,
}

impl KillAllReason {
    pub const fn describe(self) -> &'static str {
        match self {
            KillAllReason::Command => "received 'k' command",
            KillAllReason::Shutdown => "supervisor exiting",
        }
    }
}

/// What happened to one registry entry when it was sent `SIGKILL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed(Pid),
    AlreadyGone(Pid),
    /// Delivery failed for another reason; the entry stays tracked.
    Kept(Pid, Errno),
}

impl KillOutcome {
    pub fn removed(&self) -> bool {
        !matches!(self, KillOutcome::Kept(..))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillAllTally {
    /// Entries that received `SIGKILL`, in the order they were signalled.
    pub killed: Vec<Pid>,
    pub already_gone: usize,
    /// Entries left tracked after a non-`ESRCH` failure.
    pub remaining: usize,
}

impl KillAllTally {
    pub fn removed(&self) -> usize {
        self.killed.len() + self.already_gone
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTally {
    pub attempted: usize,
    pub signaled: usize,
    pub already_gone: usize,
    pub failed: usize,
}

/// Interactive manager of a pool of probe processes.
pub struct Supervisor<P: ProcessControl, T: TerminalMode, W: Write> {
    processes: P,
    terminal: T,
    out: W,
    registry: ChildRegistry,
    termination: TerminationFlag,
    phase: Phase,
    pid: Pid,
}

impl<P: ProcessControl, T: TerminalMode, W: Write> Supervisor<P, T, W> {
    /// `terminal` is expected to be enabled already; the supervisor restores it.
    pub fn new(
        processes: P,
        terminal: T,
        out: W,
        termination: TerminationFlag,
        registry_capacity: usize,
    ) -> Self {
        Self {
            processes,
            terminal,
            out,
            registry: ChildRegistry::with_initial_capacity(registry_capacity),
            termination,
            phase: Phase::Init,
            pid: getpid(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut P {
        &mut self.processes
    }

    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn print_banner(&mut self, probe_path: &Path) {
        let mut banner = String::new();
        let _ = write!(banner, "Supervisor process started (PID: {}).{LINE_END}", self.pid);
        for line in HELP {
            let _ = write!(banner, "{line}{LINE_END}");
        }
        let _ = write!(
            banner,
            "Using probe executable: {}{LINE_END}",
            probe_path.display()
        );
        if let Err(err) = write_block(&mut self.out, &banner) {
            warn!(err = %err, "failed to write banner");
        }
    }

    /// Launch a probe and track it.
    ///
    /// Launch failure leaves the registry untouched. Failure to grow the
    /// registry is fatal: the untracked probe is killed and reaped, then the
    /// process aborts.
    pub fn spawn(&mut self) -> Option<Pid> {
        let pid = match self.processes.launch() {
            Ok(pid) => pid,
            Err(err) => {
                self.report(&format!(
                    "Failed to spawn probe: {err:#}. Total probes: {}",
                    self.registry.len()
                ));
                return None;
            }
        };

        // The OS only reuses an id once its previous owner is gone.
        if let Some(stale) = self.registry.position(pid) {
            debug!(%pid, "dropping stale registry entry for reused pid");
            self.registry.remove_at(stale);
        }
        if let Err(err) = self.registry.push(pid) {
            self.abort_with_orphan(pid, &err);
        }

        info!(%pid, total = self.registry.len(), "probe spawned");
        self.report(&format!(
            "Spawned probe process with PID {pid}. Total probes: {}",
            self.registry.len()
        ));
        Some(pid)
    }

    /// `SIGKILL` the most recently spawned probe.
    pub fn kill_last(&mut self) -> Option<KillOutcome> {
        let Some(index) = self.registry.len().checked_sub(1) else {
            self.report("No probes to kill.");
            return None;
        };
        let outcome = self.kill_at(index)?;
        let remaining = self.registry.len();
        let message = match outcome {
            KillOutcome::Killed(pid) => {
                format!("Killed probe {pid}. Remaining probes: {remaining}")
            }
            KillOutcome::AlreadyGone(pid) => format!(
                "Probe {pid} had already exited; removed tracking. Remaining probes: {remaining}"
            ),
            KillOutcome::Kept(pid, errno) => format!(
                "Did not remove tracking for probe {pid} ({errno}). Remaining probes: {remaining}"
            ),
        };
        self.report(&message);
        Some(outcome)
    }

    /// `SIGKILL` every tracked probe, newest first.
    ///
    /// Walking backwards keeps the remaining indices valid as entries are removed.
    pub fn kill_all(&mut self, reason: KillAllReason) -> KillAllTally {
        let mut tally = KillAllTally::default();
        if self.registry.is_empty() {
            if reason != KillAllReason::Shutdown {
                self.report("No probes to kill. Tracked: 0, signals sent: 0.");
            }
            return tally;
        }

        info!(
            count = self.registry.len(),
            reason = reason.describe(),
            "killing all probes"
        );
        for index in (0..self.registry.len()).rev() {
            match self.kill_at(index) {
                Some(KillOutcome::Killed(pid)) => tally.killed.push(pid),
                Some(KillOutcome::AlreadyGone(_)) => tally.already_gone += 1,
                Some(KillOutcome::Kept(..)) => tally.remaining += 1,
                None => {}
            }
        }

        self.report(&format!(
            "Killed all probes ({}): {} removed ({} already exited), {} still tracked after kill errors.",
            reason.describe(),
            tally.removed(),
            tally.already_gone,
            tally.remaining
        ));
        tally
    }

    /// Send a gate signal to every tracked probe, oldest first.
    ///
    /// `ESRCH` is counted but the entry is left in place; only kills shrink
    /// the registry.
    pub fn broadcast(&mut self, signal: ProbeSignal) -> BroadcastTally {
        let mut tally = BroadcastTally::default();
        if self.registry.is_empty() {
            self.report(&format!(
                "No probes to send {} to. Attempted: 0.",
                signal.describe()
            ));
            return tally;
        }

        for index in 0..self.registry.len() {
            let Some(pid) = self.registry.get(index) else {
                break;
            };
            tally.attempted += 1;
            match self.processes.signal(pid, signal.signal()) {
                Delivery::Delivered => tally.signaled += 1,
                Delivery::Gone => tally.already_gone += 1,
                Delivery::Failed(errno) => {
                    warn!(%pid, err = %errno, signal = signal.describe(), "failed to signal probe");
                    tally.failed += 1;
                }
            }
        }

        self.report(&format!(
            "Sent {} to {} probes. Success: {}, Already exited: {}, Errors: {}. Tracked: {}",
            signal.describe(),
            tally.attempted,
            tally.signaled,
            tally.already_gone,
            tally.failed,
            self.registry.len()
        ));
        tally
    }

    /// Write the supervisor id and every tracked id as one block.
    pub fn list(&mut self) {
        let mut listing = String::new();
        let _ = write!(
            listing,
            "SUPERVISOR [{}]: Listing processes:{LINE_END}  Supervisor: {}{LINE_END}",
            self.pid, self.pid
        );
        if self.registry.is_empty() {
            let _ = write!(listing, "  No tracked probes.{LINE_END}");
        } else {
            let _ = write!(
                listing,
                "  Tracked probes ({}):{LINE_END}",
                self.registry.len()
            );
            for pid in self.registry.as_slice() {
                let _ = write!(listing, "    - PID {pid} (tracked){LINE_END}");
            }
        }
        if let Err(err) = write_block(&mut self.out, &listing) {
            warn!(err = %err, "failed to write probe listing");
        }
    }

    pub fn dispatch(&mut self, command: Command) {
        debug!(?command, "dispatching command");
        self.fresh_line();
        match command {
            Command::Spawn => {
                self.spawn();
            }
            Command::KillLast => {
                self.kill_last();
            }
            Command::List => self.list(),
            Command::KillAll => {
                self.kill_all(KillAllReason::Command);
            }
            Command::Broadcast(signal) => {
                self.broadcast(signal);
            }
            Command::Quit => {
                self.report("Received 'q' command. Initiating shutdown.");
                self.termination.request();
            }
        }
    }

    /// Read and dispatch one byte at a time until quit, end of input or a
    /// termination request.
    ///
    /// An interrupted read goes back to the flag check. Any other read error
    /// restores the terminal and is returned.
    pub fn run_commands<R: Read>(&mut self, mut input: R) -> Result<()> {
        self.phase = Phase::Running;
        let mut byte = [0u8; 1];
        let mut stopped_by_input = false;

        while !self.termination.is_requested() {
            match input.read(&mut byte) {
                Ok(0) => {
                    self.fresh_line();
                    self.report("End of input detected. Initiating shutdown.");
                    self.termination.request();
                    stopped_by_input = true;
                }
                Ok(_) => {
                    if let Some(command) = Command::from_byte(byte[0]) {
                        stopped_by_input |= command == Command::Quit;
                        self.dispatch(command);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    debug!("command read interrupted");
                }
                Err(err) => {
                    self.terminal.restore();
                    return Err(err).context("read command from stdin");
                }
            }
            self.log_reap_anomalies();
        }

        if !stopped_by_input {
            self.report("Termination signal received, initiating shutdown...");
        }
        Ok(())
    }

    /// Restore the terminal, kill and reap every tracked probe, free the registry.
    ///
    /// Runs once; later calls (including the one from `Drop`) return immediately.
    pub fn shutdown(&mut self) {
        if matches!(self.phase, Phase::ShuttingDown | Phase::Terminated) {
            return;
        }
        self.phase = Phase::ShuttingDown;
        self.terminal.restore();
        self.report("Cleaning up...");

        let tally = self.kill_all(KillAllReason::Shutdown);
        for pid in tally.killed {
            self.processes.reap(pid);
        }
        self.registry.release();

        self.report("Cleanup complete.");
        self.phase = Phase::Terminated;
    }

    fn kill_at(&mut self, index: usize) -> Option<KillOutcome> {
        let pid = self.registry.get(index)?;
        let outcome = match self.processes.signal(pid, Signal::SIGKILL) {
            Delivery::Delivered => KillOutcome::Killed(pid),
            Delivery::Gone => {
                debug!(%pid, "probe already exited");
                KillOutcome::AlreadyGone(pid)
            }
            Delivery::Failed(errno) => {
                warn!(%pid, err = %errno, "failed to send SIGKILL");
                KillOutcome::Kept(pid, errno)
            }
        };
        if outcome.removed() {
            self.registry.remove_at(index);
        }
        Some(outcome)
    }

    fn abort_with_orphan(&mut self, pid: Pid, err: &TryReserveError) -> ! {
        self.terminal.restore();
        error!(%pid, err = %err, "registry growth failed, aborting");
        if let Err(write_err) = write_line(
            &mut io::stderr(),
            &format!(
                "SUPERVISOR [{}]: Failed to grow probe registry ({err}); killing untracked probe {pid} and aborting.",
                self.pid
            ),
        ) {
            warn!(err = %write_err, "failed to write abort notice");
        }
        self.processes.signal(pid, Signal::SIGKILL);
        self.processes.reap(pid);
        std::process::abort()
    }

    fn log_reap_anomalies(&self) {
        if let Some(anomaly) = take_reap_anomaly() {
            warn!(
                count = anomaly.count,
                err = %anomaly.last_errno,
                "reaper failed while draining exited probes"
            );
        }
    }

    /// Raw mode does not return the cursor on its own.
    fn fresh_line(&mut self) {
        if let Err(err) = write_block(&mut self.out, LINE_END) {
            warn!(err = %err, "failed to write line break");
        }
    }

    fn report(&mut self, message: &str) {
        let line = format!("SUPERVISOR [{}]: {message}", self.pid);
        if let Err(err) = write_line(&mut self.out, &line) {
            warn!(err = %err, "failed to write status line");
        }
    }
}

impl<P: ProcessControl, T: TerminalMode, W: Write> Drop for Supervisor<P, T, W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::supervisor::registry::INITIAL_CAPACITY;
    use crate::test_support::{
        CapturedLogs, FailingReader, FailingWriter, InterruptedOnce, RecordingTerminal,
        ScriptedProcesses, detached_flag, scripted_supervisor,
    };

    type ScriptedSupervisor = Supervisor<ScriptedProcesses, RecordingTerminal, Vec<u8>>;

    fn output_of(supervisor: &ScriptedSupervisor) -> String {
        String::from_utf8_lossy(supervisor.output()).into_owned()
    }

    fn spawn_n(supervisor: &mut ScriptedSupervisor, n: usize) -> Vec<Pid> {
        (0..n)
            .map(|_| supervisor.spawn().expect("spawn"))
            .collect()
    }

    #[test]
    fn spawn_appends_in_spawn_order() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 3);

        assert_eq!(supervisor.registry().as_slice(), pids.as_slice());
        assert!(output_of(&supervisor).contains("Total probes: 3"));
    }

    #[test]
    fn launch_failure_leaves_registry_unchanged() {
        let mut supervisor = scripted_supervisor();
        spawn_n(&mut supervisor, 1);
        supervisor.processes_mut().fail_next_launch("fork failed");

        assert_eq!(supervisor.spawn(), None);
        assert_eq!(supervisor.registry().len(), 1);
        assert!(output_of(&supervisor).contains("Failed to spawn probe: fork failed"));
    }

    #[test]
    fn reused_pid_replaces_stale_entry() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 2);
        supervisor.processes_mut().reuse_pid(pids[0]);

        assert_eq!(supervisor.spawn(), Some(pids[0]));
        assert_eq!(supervisor.registry().as_slice(), &[pids[1], pids[0]]);
    }

    #[test]
    fn kill_last_removes_newest_entry() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 2);

        let outcome = supervisor.kill_last();

        assert_eq!(outcome, Some(KillOutcome::Killed(pids[1])));
        assert_eq!(supervisor.registry().as_slice(), &pids[..1]);
        assert_eq!(
            supervisor.processes().sent(),
            &[(pids[1], Signal::SIGKILL)]
        );
    }

    #[test]
    fn kill_last_removes_entry_already_gone() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 2);
        supervisor.processes_mut().respond(pids[1], Errno::ESRCH);

        assert_eq!(
            supervisor.kill_last(),
            Some(KillOutcome::AlreadyGone(pids[1]))
        );
        assert_eq!(supervisor.registry().len(), 1);
    }

    #[test]
    fn kill_last_keeps_entry_on_other_failure() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 2);
        supervisor.processes_mut().respond(pids[1], Errno::EPERM);

        assert_eq!(
            supervisor.kill_last(),
            Some(KillOutcome::Kept(pids[1], Errno::EPERM))
        );
        assert_eq!(supervisor.registry().as_slice(), pids.as_slice());
        assert!(output_of(&supervisor).contains("Did not remove tracking"));
    }

    #[test]
    fn kill_last_on_empty_registry_sends_nothing() {
        let mut supervisor = scripted_supervisor();

        assert_eq!(supervisor.kill_last(), None);
        assert!(supervisor.processes().sent().is_empty());
        assert!(output_of(&supervisor).contains("No probes to kill."));
    }

    #[test]
    fn kill_all_walks_newest_first_and_tallies() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 4);
        supervisor.processes_mut().respond(pids[1], Errno::ESRCH);
        supervisor.processes_mut().respond(pids[2], Errno::EPERM);

        let tally = supervisor.kill_all(KillAllReason::Command);

        let order: Vec<Pid> = supervisor
            .processes()
            .sent()
            .iter()
            .map(|(pid, _)| *pid)
            .collect();
        assert_eq!(order, vec![pids[3], pids[2], pids[1], pids[0]]);
        assert_eq!(tally.killed, vec![pids[3], pids[0]]);
        assert_eq!(tally.already_gone, 1);
        assert_eq!(tally.remaining, 1);
        assert_eq!(supervisor.registry().as_slice(), &[pids[2]]);
        assert!(output_of(&supervisor).contains("3 removed (1 already exited), 1 still tracked"));
    }

    #[test]
    fn kill_all_on_empty_registry_reports_zero() {
        let mut supervisor = scripted_supervisor();

        let tally = supervisor.kill_all(KillAllReason::Command);

        assert_eq!(tally, KillAllTally::default());
        assert!(supervisor.processes().sent().is_empty());
        assert!(output_of(&supervisor).contains("Tracked: 0, signals sent: 0."));
    }

    #[test]
    fn broadcast_on_empty_registry_sends_nothing() {
        let mut supervisor = scripted_supervisor();

        let tally = supervisor.broadcast(ProbeSignal::DisableOutput);

        assert_eq!(tally, BroadcastTally::default());
        assert!(supervisor.processes().sent().is_empty());
        assert!(output_of(&supervisor).contains("Attempted: 0."));
    }

    #[test]
    fn broadcast_counts_outcomes_without_shrinking_registry() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 3);
        supervisor.processes_mut().respond(pids[0], Errno::ESRCH);
        supervisor.processes_mut().respond(pids[2], Errno::EPERM);

        let tally = supervisor.broadcast(ProbeSignal::EnableOutput);

        assert_eq!(
            tally,
            BroadcastTally {
                attempted: 3,
                signaled: 1,
                already_gone: 1,
                failed: 1,
            }
        );
        assert_eq!(supervisor.registry().as_slice(), pids.as_slice());
        assert!(
            supervisor
                .processes()
                .sent()
                .iter()
                .all(|(_, signal)| *signal == Signal::SIGUSR1)
        );
    }

    #[test]
    fn list_writes_every_tracked_pid() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 3);

        supervisor.list();

        let output = output_of(&supervisor);
        assert!(output.contains("Tracked probes (3):"));
        for pid in pids {
            assert!(output.contains(&format!("- PID {pid} (tracked)\r\n")));
        }
    }

    #[test]
    fn shutdown_twice_matches_shutdown_once() {
        let mut supervisor = scripted_supervisor();
        let pids = spawn_n(&mut supervisor, 2);

        supervisor.shutdown();
        let sent_after_first = supervisor.processes().sent().len();
        supervisor.shutdown();

        assert_eq!(supervisor.phase(), Phase::Terminated);
        assert!(supervisor.registry().is_empty());
        assert_eq!(supervisor.processes().sent().len(), sent_after_first);
        assert_eq!(supervisor.processes().reaped(), &[pids[1], pids[0]]);
        assert_eq!(supervisor.terminal().restorations(), 1);
        assert!(!supervisor.terminal().is_raw());
    }

    #[test]
    fn command_loop_dispatches_until_end_of_input() {
        let mut supervisor = scripted_supervisor();

        supervisor
            .run_commands(Cursor::new(b"++x+-l".to_vec()))
            .expect("run");

        assert_eq!(supervisor.registry().len(), 2);
        assert_eq!(supervisor.processes().launched().len(), 3);
        assert_eq!(supervisor.phase(), Phase::Running);
        assert!(output_of(&supervisor).contains("End of input detected."));
    }

    #[test]
    fn quit_stops_reading_further_commands() {
        let mut supervisor = scripted_supervisor();

        supervisor
            .run_commands(Cursor::new(b"+q+++".to_vec()))
            .expect("run");

        assert_eq!(supervisor.registry().len(), 1);
        let output = output_of(&supervisor);
        assert!(output.contains("Received 'q' command."));
        assert!(!output.contains("Termination signal received"));
    }

    #[test]
    fn unknown_bytes_produce_no_output() {
        let mut supervisor = scripted_supervisor();

        supervisor
            .run_commands(Cursor::new(b"xyz".to_vec()))
            .expect("run");

        let output = output_of(&supervisor);
        assert_eq!(output.matches("SUPERVISOR").count(), 1);
        assert!(supervisor.registry().is_empty());
    }

    #[test]
    fn interrupted_read_is_retried() {
        let mut supervisor = scripted_supervisor();

        supervisor
            .run_commands(InterruptedOnce::new(b"+".to_vec()))
            .expect("run");

        assert_eq!(supervisor.registry().len(), 1);
    }

    #[test]
    fn termination_request_stops_the_loop() {
        let mut supervisor = scripted_supervisor();
        supervisor.spawn();
        supervisor.dispatch(Command::Quit);

        supervisor
            .run_commands(Cursor::new(b"+++".to_vec()))
            .expect("run");

        assert_eq!(supervisor.registry().len(), 1);
    }

    #[test]
    fn fatal_read_error_restores_terminal() {
        let mut supervisor = scripted_supervisor();

        let err = supervisor.run_commands(FailingReader).unwrap_err();

        assert!(err.to_string().contains("read command from stdin"));
        assert_eq!(supervisor.terminal().restorations(), 1);
    }

    #[test]
    fn output_failures_are_logged_and_commands_still_apply() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .finish();
        let mut supervisor = Supervisor::new(
            ScriptedProcesses::new(),
            RecordingTerminal::enabled(),
            FailingWriter,
            detached_flag(),
            INITIAL_CAPACITY,
        );

        tracing::subscriber::with_default(subscriber, || {
            supervisor
                .run_commands(Cursor::new(b"++-l".to_vec()))
                .expect("run");
        });

        assert_eq!(supervisor.registry().len(), 1);
        let logs = logs.contents();
        assert!(logs.contains("failed to write line break"), "{logs}");
        assert!(logs.contains("failed to write status line"), "{logs}");
        assert!(logs.contains("failed to write probe listing"), "{logs}");
    }
}
