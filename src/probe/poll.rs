//! Convergence poll loop
//!
//! Transport and decode failures during startup are expected and only mean
//! "not yet converged". They are counted and the last of each is kept so a
//! timeout can explain itself. Every attempt and every sleep is clamped to
//! the remaining budget, so the loop returns within `timeout` plus one poll
//! interval.

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::common::{ConvergenceError, DecodeError, Error, Result, TransportError};

/// Poll timing budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between attempts
    pub interval: Duration,
    /// Overall budget for reaching convergence
    pub timeout: Duration,
    /// Budget for one HTTP request including the body
    pub attempt_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

/// A value that satisfied the convergence predicate
#[derive(Debug, Clone)]
pub struct Converged<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

/// The budget ran out before a response satisfied the predicate
#[derive(Debug, Clone)]
pub struct NotConverged<T> {
    pub error: ConvergenceError,
    /// Last decoded response that did not satisfy the predicate
    pub last_observed: Option<T>,
}

/// Build the HTTP client used for polling
///
/// Proxies are disabled so that loopback endpoints are always reached
/// directly, whatever the surrounding environment says.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .map_err(|e| Error::HttpClient(e.to_string()))
}

#[derive(Debug)]
struct PollTally<T> {
    attempts: u32,
    transport_failures: u32,
    decode_failures: u32,
    unsatisfied: u32,
    last_transport_error: Option<String>,
    last_decode_error: Option<String>,
    last_observed: Option<T>,
}

impl<T> PollTally<T> {
    fn new() -> Self {
        Self {
            attempts: 0,
            transport_failures: 0,
            decode_failures: 0,
            unsatisfied: 0,
            last_transport_error: None,
            last_decode_error: None,
            last_observed: None,
        }
    }

    fn into_failure(self, budget: Duration) -> NotConverged<T> {
        let error = match self.last_decode_error {
            Some(last_decode_error) if self.unsatisfied == 0 => ConvergenceError::Undecodable {
                timeout: budget,
                attempts: self.attempts,
                decode_failures: self.decode_failures,
                last_decode_error,
                last_transport_error: self.last_transport_error,
            },
            last_decode_error => ConvergenceError::Timeout {
                timeout: budget,
                attempts: self.attempts,
                last_transport_error: self.last_transport_error,
                last_decode_error,
                unsatisfied: self.unsatisfied,
            },
        };
        NotConverged {
            error,
            last_observed: self.last_observed,
        }
    }

    fn give_up(self, budget: Duration) -> NotConverged<T> {
        tracing::warn!(
            attempts = self.attempts,
            transport_failures = self.transport_failures,
            decode_failures = self.decode_failures,
            unsatisfied = self.unsatisfied,
            "Convergence budget exhausted"
        );
        self.into_failure(budget)
    }
}

/// Fetch one response body
async fn fetch(
    client: &reqwest::Client,
    url: &str,
    budget: Duration,
) -> std::result::Result<Vec<u8>, TransportError> {
    let attempt = async {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(body.to_vec())
    };

    timeout(budget, attempt)
        .await
        .map_err(|_| TransportError::AttemptTimeout(budget))?
}

/// Poll `url` until a decoded response satisfies `predicate`
///
/// Returns the first satisfying value. Fails with
/// [`ConvergenceError::Undecodable`] when responses arrived but none could
/// be decoded, and [`ConvergenceError::Timeout`] otherwise; the last decoded
/// response is handed back with the failure. No attempt is started once the
/// budget is spent, so the last recorded error is always a real one.
pub async fn wait_for_convergence<T, D, P>(
    client: &reqwest::Client,
    url: &str,
    decode: D,
    predicate: P,
    settings: &PollSettings,
) -> std::result::Result<Converged<T>, NotConverged<T>>
where
    D: Fn(&[u8]) -> std::result::Result<T, DecodeError>,
    P: Fn(&T) -> bool,
{
    let started = Instant::now();
    let deadline = started + settings.timeout;
    let mut tally = PollTally::new();

    loop {
        tally.attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = settings.attempt_timeout.min(remaining);

        match fetch(client, url, budget).await {
            Err(e) => {
                tracing::debug!(attempt = tally.attempts, "Endpoint not ready: {}", e);
                tally.transport_failures += 1;
                tally.last_transport_error = Some(e.to_string());
            }
            Ok(body) => match decode(&body) {
                Err(e) => {
                    tracing::debug!(attempt = tally.attempts, "Response not decodable yet: {}", e);
                    tally.decode_failures += 1;
                    tally.last_decode_error = Some(e.to_string());
                }
                Ok(value) if predicate(&value) => {
                    tracing::info!(
                        attempts = tally.attempts,
                        elapsed = ?started.elapsed(),
                        "Convergence observed"
                    );
                    return Ok(Converged {
                        value,
                        attempts: tally.attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(value) => {
                    tracing::debug!(attempt = tally.attempts, "Not converged yet");
                    tally.unsatisfied += 1;
                    tally.last_observed = Some(value);
                }
            },
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(tally.give_up(settings.timeout));
        }

        tokio::time::sleep(settings.interval.min(remaining)).await;
        if Instant::now() >= deadline {
            return Err(tally.give_up(settings.timeout));
        }
    }
}
