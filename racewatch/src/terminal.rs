//! Raw input mode for the supervisor's controlling terminal.

use std::io::{self, IsTerminal};
use std::os::fd::AsFd;

use anyhow::{Context, Result, bail};
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    tcgetattr, tcsetattr,
};
use tracing::warn;

use crate::console::{LINE_END, write_block};

/// Scoped acquire/release of the terminal input mode.
pub trait TerminalMode {
    fn enable(&mut self) -> Result<()>;
    /// Put the terminal back the way `enable` found it. Idempotent.
    fn restore(&mut self);
}

/// Byte-at-a-time input with echo, signals and output post-processing off.
#[derive(Default)]
pub struct RawTerminal {
    original: Option<Termios>,
}

impl RawTerminal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminalMode for RawTerminal {
    fn enable(&mut self) -> Result<()> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            bail!("standard input is not a terminal; raw mode not applicable");
        }
        let fd = stdin.as_fd();
        let original = tcgetattr(fd).context("read terminal attributes")?;

        let mut raw = original.clone();
        raw.input_flags.remove(
            InputFlags::BRKINT
                | InputFlags::ICRNL
                | InputFlags::INPCK
                | InputFlags::ISTRIP
                | InputFlags::IXON,
        );
        raw.output_flags.remove(OutputFlags::OPOST);
        raw.control_flags.insert(ControlFlags::CS8);
        raw.local_flags.remove(
            LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN | LocalFlags::ISIG,
        );
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        if let Err(errno) = tcsetattr(fd, SetArg::TCSAFLUSH, &raw) {
            let _ = tcsetattr(fd, SetArg::TCSAFLUSH, &original);
            return Err(errno).context("enable raw mode");
        }
        self.original = Some(original);
        Ok(())
    }

    fn restore(&mut self) {
        let Some(original) = self.original.take() else {
            return;
        };
        let stdin = io::stdin();
        if let Err(errno) = tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &original) {
            warn!(err = %errno, "failed to restore terminal attributes");
        }
        let _ = write_block(&mut io::stdout(), LINE_END);
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Leaves the terminal alone. For piped input and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedTerminal;

impl TerminalMode for DetachedTerminal {
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self) {}
}
