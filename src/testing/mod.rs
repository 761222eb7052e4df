//! E2E Scenario Runner
//!
//! Reads YAML test scenarios describing the build, the backend, the
//! consumer and the expected converged state, and runs them against real
//! processes.

mod config;
mod runner;

pub use config::*;
pub use runner::run_scenario;
