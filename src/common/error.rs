//! Error types for the discovery orchestrator
//!
//! Each stage of a run has its own error enum so the reporter can classify
//! failures precisely. The crate-level [`Error`] wraps them together with
//! configuration and IO failures.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::probe::Violation;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // === Run stage errors ===
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === HTTP client errors ===
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // === Configuration errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Invalid scenario '{path}': {message}")]
    Scenario { path: String, message: String },

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },
}

impl Error {
    /// Create a scenario error for the given file
    pub fn scenario(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Scenario {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

/// Failure of the build step. Always fatal; no process has been started yet.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build command '{program}' could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare build output '{}': {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Build failed with exit code {}:\n{output}", .code.map_or_else(|| "none (signal)".to_string(), |c| c.to_string()))]
    Failed { code: Option<i32>, output: String },

    #[error("Build succeeded but artifact '{}' was not produced", .path.display())]
    MissingArtifact { path: PathBuf },
}

/// Failure to start one of the run's processes
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{name}: executable '{}' not found", .path.display())]
    NotFound { name: String, path: PathBuf },

    #[error("{name}: '{}' is not an executable file", .path.display())]
    NotExecutable { name: String, path: PathBuf },

    #[error("{name}: working directory '{}' does not exist", .path.display())]
    MissingWorkingDir { name: String, path: PathBuf },

    #[error("{name}: failed to open output log '{}': {source}", .path.display())]
    OutputLog {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{name}: failed to start '{}': {source}", .path.display())]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{name}: exited during startup with code {}", .code.map_or_else(|| "none (signal)".to_string(), |c| c.to_string()))]
    ExitedEarly { name: String, code: Option<i32> },
}

impl LaunchError {
    /// Name of the process that failed to launch
    pub fn process_name(&self) -> &str {
        match self {
            Self::NotFound { name, .. }
            | Self::NotExecutable { name, .. }
            | Self::MissingWorkingDir { name, .. }
            | Self::OutputLog { name, .. }
            | Self::Spawn { name, .. }
            | Self::ExitedEarly { name, .. } => name,
        }
    }
}

/// A single poll attempt that never produced a response body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    #[error("attempt timed out after {0:?}")]
    AttemptTimeout(Duration),
}

/// A response body that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed response body: {message}")]
pub struct DecodeError {
    pub message: String,
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// The convergence budget ran out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceError {
    #[error(
        "Convergence not observed within {timeout:?} after {attempts} attempts \
         (last transport error: {}; last decode error: {}; unsatisfied responses: {unsatisfied})",
        .last_transport_error.as_deref().unwrap_or("none"),
        .last_decode_error.as_deref().unwrap_or("none")
    )]
    Timeout {
        timeout: Duration,
        attempts: u32,
        last_transport_error: Option<String>,
        last_decode_error: Option<String>,
        unsatisfied: u32,
    },

    #[error(
        "Endpoint never returned a decodable response within {timeout:?}: \
         {decode_failures} of {attempts} attempts were malformed (last: {last_decode_error}; \
         last transport error: {})",
        .last_transport_error.as_deref().unwrap_or("none")
    )]
    Undecodable {
        timeout: Duration,
        attempts: u32,
        decode_failures: u32,
        last_decode_error: String,
        last_transport_error: Option<String>,
    },
}

impl ConvergenceError {
    /// Number of poll attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. } | Self::Undecodable { attempts, .. } => *attempts,
        }
    }
}

/// Convergence was observed but the state did not match the expectation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; "))]
pub struct AssertionError {
    pub violations: Vec<Violation>,
}

impl AssertionError {
    /// Look up the violation recorded for a criterion
    pub fn violation(&self, criterion: &str) -> Option<&Violation> {
        self.violations.iter().find(|v| v.criterion == criterion)
    }
}
