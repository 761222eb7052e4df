//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios and
//! turning them into a [`Topology`] and [`ProbePlan`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::config::ProbeConfig;
use crate::common::{Error, Result};
use crate::launcher::{BuildSpec, LaunchSpec};
use crate::orchestrator::{no_proxy_env, ProbePlan, Topology, BACKEND, CONSUMER, CONSUMER_CONFIG_FLAG};
use crate::probe::{ConvergenceCondition, ConvergenceExpectation};

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TestScenario {
    /// Name of the test scenario
    pub name: String,
    /// Optional description of what the test verifies
    pub description: Option<String>,
    /// Optional step producing the consumer executable
    pub build: Option<BuildStepConfig>,
    /// The discovery backend
    pub backend: ProcessConfig,
    /// The process consuming the backend
    pub consumer: ConsumerConfig,
    /// Overrides for the configured probe settings
    #[serde(default)]
    pub probe: ProbeOverrides,
    /// When the consumer counts as converged
    #[serde(default)]
    pub converge: ConvergenceCondition,
    /// What must hold once converged
    #[serde(default)]
    pub expect: ConvergenceExpectation,
    /// Scratch paths removed after teardown
    #[serde(default)]
    pub cleanup: Vec<PathBuf>,
}

/// Build command for the consumer
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct BuildStepConfig {
    /// Build tool, e.g. "go"
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Executable the build must produce
    pub artifact: PathBuf,
    /// Defaults to the scenario directory
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A process started from a program path
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Path to the executable, or a bare name looked up on PATH
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to the scenario directory
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub env_remove: Vec<String>,
}

/// The consumer process
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Defaults to the build artifact
    pub program: Option<PathBuf>,
    /// Passed as `--config.file=<path>`
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub env_remove: Vec<String>,
}

/// Per-scenario probe settings; unset fields fall back to the TOML config
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ProbeOverrides {
    pub url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
}

impl ProbeOverrides {
    pub fn apply(&self, defaults: &ProbeConfig) -> ProbeConfig {
        ProbeConfig {
            url: self.url.clone().unwrap_or_else(|| defaults.url.clone()),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            timeout_secs: self.timeout_secs.unwrap_or(defaults.timeout_secs),
            attempt_timeout_ms: self.attempt_timeout_ms.unwrap_or(defaults.attempt_timeout_ms),
        }
    }
}

/// Load and parse a scenario file
pub fn load_scenario(path: &Path) -> Result<TestScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| Error::scenario(path, e.to_string()))
}

/// Resolve `path` against `base` unless it is absolute
fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Like [`resolve`], but bare names are left for a PATH lookup
fn resolve_program(base: &Path, program: &Path) -> PathBuf {
    if program.components().count() > 1 {
        resolve(base, program)
    } else {
        program.to_path_buf()
    }
}

impl TestScenario {
    /// Build the run topology, resolving relative paths against `scenario_dir`
    pub fn topology(&self, scenario_dir: &Path) -> Result<Topology> {
        let build = self.build.as_ref().map(|step| BuildSpec {
            program: step.program.clone(),
            args: step.args.clone(),
            working_dir: Some(working_dir(scenario_dir, step.working_dir.as_deref())),
            env: step.env.clone(),
            artifact: resolve(scenario_dir, &step.artifact),
        });

        let backend = LaunchSpec {
            name: BACKEND.to_string(),
            program: resolve_program(scenario_dir, &self.backend.program),
            args: self.backend.args.clone(),
            working_dir: Some(working_dir(scenario_dir, self.backend.working_dir.as_deref())),
            env: self.backend.env.clone(),
            env_remove: self.backend.env_remove.clone(),
        };

        let program = match (&self.consumer.program, &build) {
            (Some(program), _) => resolve_program(scenario_dir, program),
            (None, Some(build)) => build.artifact.clone(),
            (None, None) => {
                return Err(Error::Config(format!(
                    "Scenario '{}': consumer.program is required without a build step",
                    self.name
                )))
            }
        };

        let mut args = Vec::new();
        if let Some(config_file) = &self.consumer.config_file {
            args.push(format!(
                "{}={}",
                CONSUMER_CONFIG_FLAG,
                resolve(scenario_dir, config_file).display()
            ));
        }
        args.extend(self.consumer.args.iter().cloned());

        let mut env = no_proxy_env();
        env.extend(self.consumer.env.clone());

        let consumer = LaunchSpec {
            name: CONSUMER.to_string(),
            program,
            args,
            working_dir: Some(working_dir(scenario_dir, self.consumer.working_dir.as_deref())),
            env,
            env_remove: self.consumer.env_remove.clone(),
        };

        Ok(Topology {
            build,
            backend,
            consumer,
            cleanup: self
                .cleanup
                .iter()
                .map(|path| resolve(scenario_dir, path))
                .collect(),
        })
    }

    /// Probe plan with scenario overrides applied over `defaults`
    pub fn probe_plan(&self, defaults: &ProbeConfig) -> Result<ProbePlan> {
        let probe = self.probe.apply(defaults);
        probe.validate()?;
        Ok(ProbePlan {
            settings: probe.poll_settings(),
            url: probe.url,
            condition: self.converge.clone(),
        })
    }
}

fn working_dir(scenario_dir: &Path, configured: Option<&Path>) -> PathBuf {
    configured.map_or_else(|| scenario_dir.to_path_buf(), |dir| resolve(scenario_dir, dir))
}
