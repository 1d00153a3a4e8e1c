//! Supervisor and probe configuration.
//!
//! The probe directory is the only required setting. Probe repetitions and the
//! timer interval have defaults, can be overridden per probe through the
//! environment, and can be set for every spawned probe from an optional TOML
//! file passed to the supervisor.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::unistd::{AccessFlags, access};
use serde::Deserialize;

use crate::supervisor::registry::INITIAL_CAPACITY;

/// File name of the probe executable inside the probe directory.
pub const PROBE_PROGRAM: &str = "race-probe";
/// Environment variable naming the directory that holds [`PROBE_PROGRAM`].
pub const PROBE_DIR_ENV: &str = "RACEWATCH_PROBE_DIR";
/// Environment variable overriding the probe repetition budget.
pub const REPETITIONS_ENV: &str = "RACEWATCH_PROBE_REPETITIONS";
/// Environment variable overriding the probe timer interval (microseconds).
pub const INTERVAL_ENV: &str = "RACEWATCH_PROBE_INTERVAL_US";

pub const DEFAULT_REPETITIONS: u64 = 10_001;
pub const DEFAULT_INTERVAL_US: u64 = 500;

/// How long a probe runs and how often it samples.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeSettings {
    /// Number of timer samples before the probe reports and exits.
    pub repetitions: u64,
    /// One-shot timer delay between samples, in microseconds.
    pub interval_us: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            repetitions: DEFAULT_REPETITIONS,
            interval_us: DEFAULT_INTERVAL_US,
        }
    }
}

impl ProbeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }

    pub fn validate(&self) -> Result<()> {
        if self.repetitions == 0 {
            return Err(anyhow!("probe repetitions must be > 0"));
        }
        if self.interval_us == 0 {
            return Err(anyhow!("probe interval_us must be > 0"));
        }
        Ok(())
    }

    /// Environment a spawned probe needs to pick these settings up.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (REPETITIONS_ENV, self.repetitions.to_string()),
            (INTERVAL_ENV, self.interval_us.to_string()),
        ]
    }
}

/// Supervisor configuration (TOML).
///
/// Missing fields default to the values the probe itself would use.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Registry slots allocated up front; the registry doubles from here.
    pub registry_capacity: usize,

    pub probe: ProbeSettings,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            registry_capacity: INITIAL_CAPACITY,
            probe: ProbeSettings::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.registry_capacity == 0 {
            return Err(anyhow!("registry_capacity must be > 0"));
        }
        self.probe.validate().context("invalid [probe] section")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Resolve `<dir>/race-probe` and check that it can be executed.
pub fn resolve_probe_executable(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(PROBE_PROGRAM);
    access(path.as_path(), AccessFlags::X_OK).with_context(|| {
        format!(
            "probe executable '{}' not found or not executable",
            path.display()
        )
    })?;
    Ok(path)
}
