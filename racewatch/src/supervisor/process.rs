//! Launching, signalling and reaping probe processes.

use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::config::ProbeSettings;
use crate::supervisor::signals::LaunchGuard;

/// Dispositions reset to default between fork and exec of a probe.
pub const INHERITED_RESET: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGCHLD,
];

/// Result of sending a signal to one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// `ESRCH`: the target already exited.
    Gone,
    /// Any other failure (e.g. `EPERM`); the target may still be alive.
    Failed(Errno),
}

impl Delivery {
    pub fn from_result(result: nix::Result<()>) -> Self {
        match result {
            Ok(()) => Delivery::Delivered,
            Err(Errno::ESRCH) => Delivery::Gone,
            Err(errno) => Delivery::Failed(errno),
        }
    }
}

/// OS operations the supervisor performs on probes.
pub trait ProcessControl {
    /// Start a new probe and return its id.
    fn launch(&mut self) -> Result<Pid>;
    /// Send `signal` to `pid`.
    fn signal(&mut self, pid: Pid, signal: Signal) -> Delivery;
    /// Block until `pid` has been reaped (by us or by the asynchronous reaper).
    fn reap(&mut self, pid: Pid);
}

/// Where a launched probe's stdout and stderr go.
#[derive(Debug, Default)]
pub enum ProbeOutput {
    /// Share the supervisor's terminal.
    #[default]
    Inherit,
    Discard,
    /// Write to these files; every probe gets its own handles onto them.
    Files { stdout: File, stderr: File },
}

impl ProbeOutput {
    fn apply(&self, cmd: &mut Command) -> Result<()> {
        match self {
            ProbeOutput::Inherit => {}
            ProbeOutput::Discard => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            ProbeOutput::Files { stdout, stderr } => {
                cmd.stdout(stdout.try_clone().context("clone probe stdout")?)
                    .stderr(stderr.try_clone().context("clone probe stderr")?);
            }
        }
        Ok(())
    }
}

/// Spawns the real `race-probe` executable.
pub struct OsProcesses {
    probe_path: PathBuf,
    probe_env: Vec<(&'static str, String)>,
    output: ProbeOutput,
}

impl OsProcesses {
    pub fn new(probe_path: &Path, settings: &ProbeSettings) -> Self {
        Self {
            probe_path: probe_path.to_path_buf(),
            probe_env: settings.env_vars(),
            output: ProbeOutput::Inherit,
        }
    }

    /// Send probe stdout/stderr to `/dev/null` instead of the shared terminal.
    pub fn with_detached_output(self) -> Self {
        self.with_output(ProbeOutput::Discard)
    }

    pub fn with_output(mut self, output: ProbeOutput) -> Self {
        self.output = output;
        self
    }

    pub fn probe_path(&self) -> &Path {
        &self.probe_path
    }
}

impl ProcessControl for OsProcesses {
    fn launch(&mut self) -> Result<Pid> {
        let mut cmd = Command::new(&self.probe_path);
        cmd.envs(self.probe_env.iter().map(|(key, value)| (*key, value.as_str())));
        self.output.apply(&mut cmd)?;
        reset_inherited_dispositions_on_exec(&mut cmd);

        let spawned = {
            let _guard = LaunchGuard::begin();
            cmd.spawn()
        };
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                error!(err = %err, path = %self.probe_path.display(), "failed to spawn probe");
                return Err(err)
                    .with_context(|| format!("spawn {}", self.probe_path.display()));
            }
        };
        let raw = i32::try_from(child.id()).context("probe pid out of range")?;
        debug!(pid = raw, "probe launched");
        // Dropping the handle neither waits nor kills; the pid is tracked by the registry.
        Ok(Pid::from_raw(raw))
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Delivery {
        Delivery::from_result(kill(pid, signal))
    }

    fn reap(&mut self, pid: Pid) {
        loop {
            match waitpid(pid, None) {
                Ok(_) | Err(Errno::ECHILD) => return,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(%pid, err = %errno, "failed to reap probe");
                    return;
                }
            }
        }
    }
}

#[allow(unsafe_code)]
fn reset_inherited_dispositions_on_exec(cmd: &mut Command) {
    // SAFETY: the hook runs in the forked child before exec and only calls
    // sigaction, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(reset_inherited_dispositions);
    }
}

#[allow(unsafe_code)]
fn reset_inherited_dispositions() -> io::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in INHERITED_RESET {
        // SAFETY: installing SIG_DFL has no handler-safety requirements.
        unsafe { sigaction(signal, &default) }.map_err(io::Error::from)?;
    }
    Ok(())
}
