//! Configuration file handling
//!
//! Holds the defaults every scenario inherits: polling budget, teardown
//! grace periods, child output handling and log locations. Scenario files
//! override the probe settings per run.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::launcher::{LaunchSettings, OutputMode, TeardownSettings};
use crate::probe::PollSettings;

/// Default introspection endpoint of the consumer
pub const DEFAULT_TARGETS_URL: &str = "http://localhost:9090/api/v1/targets";

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Convergence polling settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Process startup settings
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Process teardown settings
    #[serde(default)]
    pub teardown: TeardownConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Convergence polling settings
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    /// Introspection endpoint to poll
    #[serde(default = "default_url")]
    pub url: String,

    /// Delay between poll attempts
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Overall convergence budget
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Budget for a single HTTP attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_probe_timeout(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

impl ProbeConfig {
    /// Reject settings that would turn the poll loop into a busy loop
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(super::Error::Config(
                "probe.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

fn default_url() -> String {
    DEFAULT_TARGETS_URL.to_string()
}
fn default_poll_interval() -> u64 {
    500
}
fn default_probe_timeout() -> u64 {
    60
}
fn default_attempt_timeout() -> u64 {
    2_000
}

/// How child stdout/stderr is handled
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Share the orchestrator's terminal
    Inherit,
    /// Discard all output
    Null,
    /// Append to `<log_dir>/<process>.log`
    #[default]
    LogFile,
}

/// Process startup settings
#[derive(Debug, Deserialize, Clone)]
pub struct LaunchConfig {
    /// How long a freshly started process must stay alive to count as started
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// Where child output goes
    #[serde(default)]
    pub output: OutputKind,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: default_startup_grace(),
            output: OutputKind::default(),
        }
    }
}

fn default_startup_grace() -> u64 {
    200
}

/// Process teardown settings
#[derive(Debug, Deserialize, Clone)]
pub struct TeardownConfig {
    /// Time allowed between SIGTERM and a forced kill
    #[serde(default = "default_grace")]
    pub grace_ms: u64,

    /// Time allowed to reap a process after the forced kill
    #[serde(default = "default_reap_timeout")]
    pub reap_timeout_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace(),
            reap_timeout_ms: default_reap_timeout(),
        }
    }
}

impl TeardownConfig {
    pub fn settings(&self) -> TeardownSettings {
        TeardownSettings {
            grace: Duration::from_millis(self.grace_ms),
            reap_timeout: Duration::from_millis(self.reap_timeout_ms),
        }
    }
}

fn default_grace() -> u64 {
    5_000
}
fn default_reap_timeout() -> u64 {
    2_000
}

/// Log output settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for run and per-process logs; platform data dir when unset
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Log directory for a named run
    pub fn run_log_dir(&self, run_name: &str) -> Option<PathBuf> {
        let slug = super::paths::slug(run_name);
        match &self.log_dir {
            Some(dir) => Some(dir.join(slug)),
            None => super::paths::log_dir().map(|dir| dir.join(slug)),
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::from_path(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        config.probe.validate()?;
        Ok(config)
    }

    /// Launcher settings for a named run
    pub fn launch_settings(&self, run_name: &str) -> LaunchSettings {
        let output = match self.launch.output {
            OutputKind::Inherit => OutputMode::Inherit,
            OutputKind::Null => OutputMode::Null,
            OutputKind::LogFile => match self.logging.run_log_dir(run_name) {
                Some(dir) => OutputMode::LogFile(dir),
                None => OutputMode::Null,
            },
        };

        LaunchSettings {
            startup_grace: Duration::from_millis(self.launch.startup_grace_ms),
            output,
        }
    }
}
