//! Test-only fakes for the probe timer, process control and terminal, plus
//! helpers for driving the real binaries.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;
use wait_timeout::ChildExt;

use crate::config::{INTERVAL_ENV, PROBE_PROGRAM, REPETITIONS_ENV};
use crate::probe::store::SharedPairStore;
use crate::probe::timer::OneShotTimer;
use crate::supervisor::Supervisor;
use crate::supervisor::process::{Delivery, ProcessControl};
use crate::supervisor::registry::INITIAL_CAPACITY;
use crate::supervisor::signals::TerminationFlag;
use crate::terminal::TerminalMode;

/// One-shot timer that samples the store from a helper thread.
pub struct ThreadTimer {
    store: Arc<SharedPairStore>,
    armed: usize,
    fail_after: Option<usize>,
}

impl ThreadTimer {
    pub fn new(store: Arc<SharedPairStore>) -> Self {
        Self {
            store,
            armed: 0,
            fail_after: None,
        }
    }

    /// Let the first `arms` calls succeed and fail every one after.
    pub fn fail_after(mut self, arms: usize) -> Self {
        self.fail_after = Some(arms);
        self
    }

    pub fn armed(&self) -> usize {
        self.armed
    }
}

impl OneShotTimer for ThreadTimer {
    fn arm(&mut self, interval: Duration) -> Result<()> {
        if let Some(limit) = self.fail_after
            && self.armed >= limit
        {
            bail!("scripted timer failure after {limit} arms");
        }
        self.armed += 1;
        let store = Arc::clone(&self.store);
        thread::spawn(move || {
            thread::sleep(interval);
            store.record_sample();
        });
        Ok(())
    }
}

/// Process control that hands out fake pids and records every call.
#[derive(Debug)]
pub struct ScriptedProcesses {
    next_pid: i32,
    launch_failures: VecDeque<String>,
    responses: HashMap<Pid, Errno>,
    launched: Vec<Pid>,
    sent: Vec<(Pid, Signal)>,
    reaped: Vec<Pid>,
}

impl Default for ScriptedProcesses {
    fn default() -> Self {
        Self {
            next_pid: 40_000,
            launch_failures: VecDeque::new(),
            responses: HashMap::new(),
            launched: Vec::new(),
            sent: Vec::new(),
            reaped: Vec::new(),
        }
    }
}

impl ScriptedProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `launch` fail with `message`.
    pub fn fail_next_launch(&mut self, message: &str) {
        self.launch_failures.push_back(message.to_string());
    }

    /// Make every signal sent to `pid` fail with `errno`.
    pub fn respond(&mut self, pid: Pid, errno: Errno) {
        self.responses.insert(pid, errno);
    }

    /// Hand out `pid` again on the next launch.
    pub fn reuse_pid(&mut self, pid: Pid) {
        self.next_pid = pid.as_raw();
    }

    pub fn launched(&self) -> &[Pid] {
        &self.launched
    }

    pub fn sent(&self) -> &[(Pid, Signal)] {
        &self.sent
    }

    pub fn reaped(&self) -> &[Pid] {
        &self.reaped
    }
}

impl ProcessControl for ScriptedProcesses {
    fn launch(&mut self) -> Result<Pid> {
        if let Some(message) = self.launch_failures.pop_front() {
            return Err(anyhow!(message));
        }
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        self.launched.push(pid);
        Ok(pid)
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Delivery {
        self.sent.push((pid, signal));
        match self.responses.get(&pid) {
            Some(errno) => Delivery::from_result(Err(*errno)),
            None => Delivery::Delivered,
        }
    }

    fn reap(&mut self, pid: Pid) {
        self.reaped.push(pid);
    }
}

/// Terminal that counts mode transitions instead of touching a tty.
#[derive(Debug, Default)]
pub struct RecordingTerminal {
    raw: bool,
    enables: usize,
    restorations: usize,
}

impl RecordingTerminal {
    /// A terminal already switched to raw mode.
    pub fn enabled() -> Self {
        Self {
            raw: true,
            enables: 1,
            restorations: 0,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn enables(&self) -> usize {
        self.enables
    }

    pub fn restorations(&self) -> usize {
        self.restorations
    }
}

impl TerminalMode for RecordingTerminal {
    fn enable(&mut self) -> Result<()> {
        self.raw = true;
        self.enables += 1;
        Ok(())
    }

    fn restore(&mut self) {
        if self.raw {
            self.raw = false;
            self.restorations += 1;
        }
    }
}

/// A termination flag private to one test.
pub fn detached_flag() -> TerminationFlag {
    TerminationFlag::from_static(Box::leak(Box::new(AtomicBool::new(false))))
}

/// Supervisor over scripted processes, a raw recording terminal and an in-memory output.
pub fn scripted_supervisor() -> Supervisor<ScriptedProcesses, RecordingTerminal, Vec<u8>> {
    Supervisor::new(
        ScriptedProcesses::new(),
        RecordingTerminal::enabled(),
        Vec::new(),
        detached_flag(),
        INITIAL_CAPACITY,
    )
}

/// Reader that fails the first read with `EINTR`, then serves `bytes`.
pub struct InterruptedOnce {
    interrupted: bool,
    inner: Cursor<Vec<u8>>,
}

impl InterruptedOnce {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            interrupted: false,
            inner: Cursor::new(bytes),
        }
    }
}

impl Read for InterruptedOnce {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.interrupted {
            self.interrupted = true;
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        self.inner.read(buf)
    }
}

/// Reader whose every read fails with a non-retryable error.
pub struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(Errno::EIO as i32))
    }
}

/// Writer whose every write fails, like a closed terminal.
pub struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// In-memory sink for a `tracing` fmt subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn probe_dir_with_mode(mode: u32) -> Result<TempDir> {
    let dir = tempfile::tempdir().context("create probe dir")?;
    let path = dir.path().join(PROBE_PROGRAM);
    fs::write(&path, "#!/bin/sh\nexit 0\n").context("write probe stub")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(mode))
        .context("set probe permissions")?;
    Ok(dir)
}

/// Temp dir holding an executable `race-probe` script that exits immediately.
pub fn executable_probe_dir() -> Result<TempDir> {
    probe_dir_with_mode(0o755)
}

/// Temp dir holding a `race-probe` file without execute permission.
pub fn non_executable_probe_dir() -> Result<TempDir> {
    probe_dir_with_mode(0o644)
}

/// Temp dir holding a symlink named `race-probe` that points at `exe`.
pub fn linked_probe_dir(exe: &Path) -> Result<TempDir> {
    let dir = tempfile::tempdir().context("create probe dir")?;
    std::os::unix::fs::symlink(exe, dir.path().join(PROBE_PROGRAM))
        .context("link probe executable")?;
    Ok(dir)
}

/// Command for the probe binary with piped output and the given budget.
pub fn probe_command(exe: &Path, repetitions: u64, interval_us: u64) -> Command {
    let mut cmd = Command::new(exe);
    cmd.env(REPETITIONS_ENV, repetitions.to_string())
        .env(INTERVAL_ENV, interval_us.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Wait for `child`, killing it if it outlives `timeout`.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            bail!("child {} did not exit within {timeout:?}", child.id())
        }
    }
}

/// Poll `path` until some line contains `needle`, and return that line.
pub fn wait_for_line(path: &Path, needle: &str, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let contents = fs::read_to_string(path).unwrap_or_default();
        if let Some(line) = contents.lines().find(|line| line.contains(needle)) {
            return Ok(line.to_string());
        }
        if Instant::now() >= deadline {
            bail!("{needle:?} not written to {} within {timeout:?}", path.display());
        }
        thread::sleep(Duration::from_millis(10));
    }
}
