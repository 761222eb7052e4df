//! Convergence Prober
//!
//! Polls the consumer's introspection endpoint, decodes the targets
//! response and evaluates predicates over it.

mod expectation;
mod poll;
mod types;

#[cfg(test)]
pub(crate) mod stub;

pub use expectation::{ConvergenceCondition, ConvergenceExpectation, Violation, STATUS_SUCCESS};
pub use poll::{http_client, wait_for_convergence, Converged, NotConverged, PollSettings};
pub use types::{decode_targets, ActiveTarget, ProbeResult, TargetsData, HEALTH_UP};
