//! Predicates over a decoded probe result
//!
//! [`ConvergenceCondition`] decides when the consumer has caught up and the
//! poll loop can stop. [`ConvergenceExpectation`] is what the scenario then
//! asserts. Keeping them apart lets a converged-but-wrong state fail with
//! observed vs expected values instead of timing out.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use super::types::ProbeResult;

/// Status string of a successful API response
pub const STATUS_SUCCESS: &str = "success";

/// Readiness predicate the prober waits for
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConvergenceCondition {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_min_active_targets")]
    pub min_active_targets: usize,
}

impl Default for ConvergenceCondition {
    fn default() -> Self {
        Self {
            status: default_status(),
            min_active_targets: default_min_active_targets(),
        }
    }
}

fn default_status() -> String {
    STATUS_SUCCESS.to_string()
}
fn default_min_active_targets() -> usize {
    1
}

impl ConvergenceCondition {
    pub fn is_met(&self, result: &ProbeResult) -> bool {
        result.status == self.status && result.active_count() >= self.min_active_targets
    }
}

/// One expectation criterion that did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub criterion: String,
    pub expected: String,
    pub observed: String,
}

impl Violation {
    fn new(criterion: impl Into<String>, expected: impl ToString, observed: impl ToString) -> Self {
        Self {
            criterion: criterion.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {}",
            self.criterion, self.expected, self.observed
        )
    }
}

/// Expected state of the consumer once converged
///
/// All criteria are optional and must hold together. An empty expectation
/// is satisfied by any result.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConvergenceExpectation {
    /// Expected `status` string
    pub status: Option<String>,
    /// Exact number of active targets
    pub active_targets: Option<usize>,
    /// Exact number of dropped targets
    pub dropped_targets: Option<usize>,
    /// Every active target reports health "up"
    #[serde(default)]
    pub all_healthy: bool,
    /// Discovered labels every active target must carry with these values
    #[serde(default)]
    pub discovered_labels: BTreeMap<String, String>,
    /// Resolved labels every active target must carry with these values
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ConvergenceExpectation {
    /// Expect exactly `n` active targets
    pub fn active_targets(n: usize) -> Self {
        Self {
            active_targets: Some(n),
            ..Self::default()
        }
    }

    pub fn all_healthy(mut self) -> Self {
        self.all_healthy = true;
        self
    }

    pub fn with_discovered_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.discovered_labels.insert(name.into(), value.into());
        self
    }

    /// Check every criterion; an empty list means the expectation holds
    pub fn check(&self, result: &ProbeResult) -> Vec<Violation> {
        let mut violations = Vec::new();

        if let Some(expected) = &self.status {
            if &result.status != expected {
                violations.push(Violation::new("status", expected, &result.status));
            }
        }

        if let Some(expected) = self.active_targets {
            if result.active_count() != expected {
                violations.push(Violation::new(
                    "active_targets",
                    expected,
                    result.active_count(),
                ));
            }
        }

        if let Some(expected) = self.dropped_targets {
            if result.dropped_count() != expected {
                violations.push(Violation::new(
                    "dropped_targets",
                    expected,
                    result.dropped_count(),
                ));
            }
        }

        if self.all_healthy {
            let unhealthy: Vec<String> = result
                .active_targets()
                .iter()
                .filter(|t| !t.is_healthy())
                .map(|t| format!("{} ({})", t.scrape_url, t.health))
                .collect();
            if !unhealthy.is_empty() {
                violations.push(Violation::new(
                    "all_healthy",
                    format!("{} healthy", result.active_count()),
                    format!(
                        "{} healthy; unhealthy: {}",
                        result.healthy_count(),
                        unhealthy.join(", ")
                    ),
                ));
            }
        }

        for (name, value) in &self.discovered_labels {
            let matching = result.with_discovered_label(name, value).count();
            if matching != result.active_count() {
                violations.push(Violation::new(
                    format!("discovered_labels.{name}"),
                    format!("{value:?} on all {} targets", result.active_count()),
                    format!("{value:?} on {matching}"),
                ));
            }
        }

        for (name, value) in &self.labels {
            let matching = result
                .active_targets()
                .iter()
                .filter(|t| t.label(name) == Some(value.as_str()))
                .count();
            if matching != result.active_count() {
                violations.push(Violation::new(
                    format!("labels.{name}"),
                    format!("{value:?} on all {} targets", result.active_count()),
                    format!("{value:?} on {matching}"),
                ));
            }
        }

        violations
    }

    pub fn is_satisfied_by(&self, result: &ProbeResult) -> bool {
        self.check(result).is_empty()
    }
}
