//! Interactive supervisor for race observation probes.
//!
//! Puts the terminal in raw mode and reads single-byte commands that spawn,
//! kill, list and signal `race-probe` processes.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use nix::unistd::getpid;
use tracing::{info, warn};

use racewatch::config::{PROBE_DIR_ENV, load_config, resolve_probe_executable};
use racewatch::console::write_line;
use racewatch::exit_codes;
use racewatch::logging;
use racewatch::supervisor::Supervisor;
use racewatch::supervisor::process::OsProcesses;
use racewatch::supervisor::signals::{TerminationFlag, install_supervisor_handlers};
use racewatch::terminal::{DetachedTerminal, RawTerminal, TerminalMode};

#[derive(Parser)]
#[command(
    name = "racewatch",
    version,
    about = "Spawn, signal and reap race observation probes from the keyboard"
)]
struct Cli {
    /// Directory containing the `race-probe` executable.
    #[arg(long, env = PROBE_DIR_ENV)]
    probe_dir: Option<PathBuf>,

    /// Optional TOML file with probe settings and registry capacity.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read commands without switching the terminal to raw mode.
    #[arg(long)]
    no_raw: bool,

    #[arg(hide = true)]
    extra: Vec<String>,
}

fn main() {
    logging::init();
    match run() {
        Ok(()) => std::process::exit(exit_codes::OK),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if !cli.extra.is_empty()
        && let Err(err) = write_line(
            &mut io::stderr(),
            &format!(
                "SUPERVISOR [{}]: Info: Command-line arguments ignored: {}",
                getpid(),
                cli.extra.join(" ")
            ),
        )
    {
        warn!(err = %err, "failed to write argument notice");
    }

    let probe_dir = cli.probe_dir.ok_or_else(|| {
        anyhow!("probe directory not set: pass --probe-dir or set {PROBE_DIR_ENV}")
    })?;
    let probe_path = resolve_probe_executable(&probe_dir)?;
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Default::default(),
    };

    let processes = OsProcesses::new(&probe_path, &config.probe);
    if cli.no_raw {
        supervise(processes, DetachedTerminal, config.registry_capacity)
    } else {
        supervise(processes, RawTerminal::new(), config.registry_capacity)
    }
}

fn supervise<T: TerminalMode>(
    processes: OsProcesses,
    mut terminal: T,
    registry_capacity: usize,
) -> Result<()> {
    terminal.enable().context("enable raw terminal mode")?;
    if let Err(err) = install_supervisor_handlers() {
        terminal.restore();
        return Err(err);
    }

    let probe_path = processes.probe_path().to_path_buf();
    let mut supervisor = Supervisor::new(
        processes,
        terminal,
        io::stdout(),
        TerminationFlag::process(),
        registry_capacity,
    );
    supervisor.print_banner(&probe_path);
    info!(pid = %supervisor.pid(), probe = %probe_path.display(), "supervisor running");

    supervisor.run_commands(io::stdin().lock())?;
    supervisor.shutdown();
    Ok(())
}
