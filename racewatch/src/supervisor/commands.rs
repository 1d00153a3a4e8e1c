//! Single-byte command protocol read by the supervisor loop.

use nix::sys::signal::Signal;

use crate::probe::handlers::{DISABLE_OUTPUT, ENABLE_OUTPUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Spawn,
    KillLast,
    List,
    KillAll,
    Broadcast(ProbeSignal),
    Quit,
}

impl Command {
    /// Map an input byte to a command. Unrecognized bytes are `None`.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'+' => Some(Command::Spawn),
            b'-' => Some(Command::KillLast),
            b'l' => Some(Command::List),
            b'k' => Some(Command::KillAll),
            b'1' => Some(Command::Broadcast(ProbeSignal::EnableOutput)),
            b'2' => Some(Command::Broadcast(ProbeSignal::DisableOutput)),
            b'q' => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Help shown in the startup banner.
pub const HELP: [&str; 3] = [
    "Commands: '+' spawn, '-' kill last, 'l' list, 'k' kill all,",
    "          '1' enable probe output (SIGUSR1), '2' disable probe output (SIGUSR2),",
    "          'q' quit.",
];

/// Control signals understood by a probe's output gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSignal {
    EnableOutput,
    DisableOutput,
}

impl ProbeSignal {
    pub const fn signal(self) -> Signal {
        match self {
            ProbeSignal::EnableOutput => ENABLE_OUTPUT,
            ProbeSignal::DisableOutput => DISABLE_OUTPUT,
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            ProbeSignal::EnableOutput => "SIGUSR1 (enable output)",
            ProbeSignal::DisableOutput => "SIGUSR2 (disable output)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_command_byte() {
        let parsed: Vec<Option<Command>> = b"+-lk12q"
            .iter()
            .map(|byte| Command::from_byte(*byte))
            .collect();
        assert_eq!(
            parsed,
            vec![
                Some(Command::Spawn),
                Some(Command::KillLast),
                Some(Command::List),
                Some(Command::KillAll),
                Some(Command::Broadcast(ProbeSignal::EnableOutput)),
                Some(Command::Broadcast(ProbeSignal::DisableOutput)),
                Some(Command::Quit),
            ]
        );
    }

    #[test]
    fn other_bytes_are_ignored() {
        for byte in [b'x', b'\n', b'\r', 0x03, b'Q'] {
            assert_eq!(Command::from_byte(byte), None);
        }
    }

    #[test]
    fn broadcast_signals_match_the_probe_gate() {
        assert_eq!(ProbeSignal::EnableOutput.signal(), Signal::SIGUSR1);
        assert_eq!(ProbeSignal::DisableOutput.signal(), Signal::SIGUSR2);
    }
}
