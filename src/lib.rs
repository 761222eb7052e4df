//! Discovery E2E - end-to-end checks for service-discovery integrations
//!
//! Builds a consumer binary, starts a discovery backend and the consumer,
//! waits for the consumer's introspection endpoint to converge and asserts
//! the observed targets. Every launched process is torn down whatever the
//! outcome.

pub mod common;
pub mod launcher;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use orchestrator::{Orchestrator, ProbePlan, RunState, Topology};
pub use probe::{ConvergenceCondition, ConvergenceExpectation, PollSettings, ProbeResult};
pub use report::{RunReport, TestOutcome};
