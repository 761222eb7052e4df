//! Result Reporter
//!
//! Classifies a run as Pass, Fail or Error and renders a human-readable
//! summary. Signalling the result to the surrounding harness is left to the
//! caller, usually through [`RunReport::into_result`].

use std::fmt::Write as _;
use std::time::Duration;

use colored::Colorize;

use crate::common::{AssertionError, Error, Result};
use crate::launcher::{ProcessState, ProcessSummary};
use crate::orchestrator::RunState;
use crate::probe::{ConvergenceExpectation, ProbeResult};

/// Terminal classification of one run
#[derive(Debug)]
pub enum TestOutcome {
    Pass,
    /// Converged, but the observed state did not match the expectation
    Fail(AssertionError),
    /// The run could not reach the assertion step
    Error(Error),
}

impl TestOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Classify an observed result against an expectation
///
/// Upstream failures (build, launch, convergence timeout) become `Error`
/// with the cause attached.
pub fn evaluate(
    observed: std::result::Result<&ProbeResult, Error>,
    expectation: &ConvergenceExpectation,
) -> TestOutcome {
    match observed {
        Err(cause) => TestOutcome::Error(cause),
        Ok(result) => {
            let violations = expectation.check(result);
            if violations.is_empty() {
                TestOutcome::Pass
            } else {
                TestOutcome::Fail(AssertionError { violations })
            }
        }
    }
}

/// Everything known about a finished run
#[derive(Debug)]
pub struct RunReport {
    pub name: String,
    pub outcome: TestOutcome,
    /// Every state the run entered, starting with `Idle`
    pub trace: Vec<RunState>,
    /// Poll attempts made, when polling started
    pub attempts: Option<u32>,
    pub elapsed: Duration,
    /// Final state of each launched process
    pub processes: Vec<ProcessSummary>,
    /// The asserted snapshot, or the last decoded one when polling gave up
    pub observed: Option<ProbeResult>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.outcome.is_pass()
    }

    pub fn final_state(&self) -> Option<RunState> {
        self.trace.last().copied()
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSummary> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// Convert to a plain result for use in a `#[test]` function
    pub fn into_result(self) -> Result<()> {
        match self.outcome {
            TestOutcome::Pass => Ok(()),
            TestOutcome::Fail(assertion) => Err(Error::TestAssertion(format!(
                "{}: {}",
                self.name, assertion
            ))),
            TestOutcome::Error(e) => Err(e),
        }
    }

    /// Render a multi-line summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        let secs = self.elapsed.as_secs_f64();

        match &self.outcome {
            TestOutcome::Pass => {
                let _ = writeln!(
                    out,
                    "{} {} passed in {:.1}s",
                    "✓".green().bold(),
                    self.name.white().bold(),
                    secs
                );
            }
            TestOutcome::Fail(assertion) => {
                let _ = writeln!(
                    out,
                    "{} {} failed in {:.1}s",
                    "✗".red().bold(),
                    self.name.white().bold(),
                    secs
                );
                for violation in &assertion.violations {
                    let _ = writeln!(out, "  {} {}", "-".red(), violation);
                }
            }
            TestOutcome::Error(e) => {
                let _ = writeln!(
                    out,
                    "{} {} errored in {:.1}s",
                    "!".yellow().bold(),
                    self.name.white().bold(),
                    secs
                );
                let _ = writeln!(out, "  {} {}", "cause:".yellow(), e);
            }
        }

        if let Some(attempts) = self.attempts {
            let _ = writeln!(out, "  {} {}", "poll attempts:".dimmed(), attempts);
        }

        if let Some(observed) = &self.observed {
            let _ = writeln!(
                out,
                "  {} status={} active={} healthy={} dropped={}",
                "observed:".dimmed(),
                observed.status,
                observed.active_count(),
                observed.healthy_count(),
                observed.dropped_count()
            );
        }

        let states: Vec<String> = self.trace.iter().map(|s| s.to_string()).collect();
        let _ = writeln!(out, "  {} {}", "states:".dimmed(), states.join(" -> "));

        for process in &self.processes {
            let pid = process
                .pid
                .map_or_else(|| "?".to_string(), |p| p.to_string());
            let state = match process.state {
                ProcessState::Starting => "starting".to_string(),
                ProcessState::Running => "still running".to_string(),
                ProcessState::Exited { code: Some(code) } => format!("exited ({code})"),
                ProcessState::Exited { code: None } => "exited (signal)".to_string(),
            };
            let _ = writeln!(out, "  {} (pid {}): {}", process.name, pid, state);
        }

        out
    }
}
