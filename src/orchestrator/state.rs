//! Run lifecycle states

use std::fmt;

/// Where a run is in its lifecycle
///
/// `Idle -> Building -> BackendStarting -> ConsumerStarting ->
/// AwaitingConvergence -> Asserting -> TornDown`, with `Failed` reachable
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Building,
    BackendStarting,
    ConsumerStarting,
    AwaitingConvergence,
    Asserting,
    TornDown,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TornDown | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Idle, Building)
                | (Building, BackendStarting)
                | (BackendStarting, ConsumerStarting)
                | (ConsumerStarting, AwaitingConvergence)
                | (AwaitingConvergence, Asserting)
                | (Asserting, TornDown)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::BackendStarting => "backend-starting",
            Self::ConsumerStarting => "consumer-starting",
            Self::AwaitingConvergence => "awaiting-convergence",
            Self::Asserting => "asserting",
            Self::TornDown => "torn-down",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
