//! Lifecycle Orchestrator
//!
//! Drives one run through build, backend launch, consumer launch and the
//! convergence wait, then asserts the observed state. Teardown of every
//! launched process runs on all paths before the report is produced.

mod state;
mod topology;

use std::path::PathBuf;
use std::time::Instant;

pub use state::RunState;
pub use topology::{
    backend_spec, consumer_spec, no_proxy_env, ProbePlan, Topology, BACKEND, CONSUMER,
    CONSUMER_CONFIG_FLAG, NO_PROXY_HOSTS,
};

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::launcher::{Handle, Launcher, ProcessSummary, SystemLauncher};
use crate::probe::{
    decode_targets, http_client, wait_for_convergence, ConvergenceExpectation, ProbeResult,
};
use crate::report::{evaluate, RunReport, TestOutcome};

/// Handles and counters collected while a run progresses
struct Progress<H> {
    backend: Option<H>,
    consumer: Option<H>,
    attempts: Option<u32>,
    /// Last decoded snapshot when polling gave up
    last_observed: Option<ProbeResult>,
}

/// Runs one topology from build to teardown
pub struct Orchestrator<L: Launcher> {
    launcher: L,
    client: reqwest::Client,
    state: RunState,
    trace: Vec<RunState>,
}

impl Orchestrator<SystemLauncher> {
    /// Orchestrator over real processes, configured from `config`
    pub fn from_config(config: &Config, run_name: &str) -> Result<Self> {
        let launcher = SystemLauncher::new(
            config.launch_settings(run_name),
            config.teardown.settings(),
        );
        Self::new(launcher)
    }
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(launcher: L) -> Result<Self> {
        Ok(Self::with_client(launcher, http_client()?))
    }

    pub fn with_client(launcher: L, client: reqwest::Client) -> Self {
        Self {
            launcher,
            client,
            state: RunState::Idle,
            trace: vec![RunState::Idle],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(from = %self.state, to = %next, "Run state changed");
        self.state = next;
        self.trace.push(next);
    }

    /// Execute the run and classify its outcome
    ///
    /// Never returns early: every failure is captured in the report after
    /// the launched processes have been torn down.
    pub async fn run(
        mut self,
        name: &str,
        topology: &Topology,
        plan: &ProbePlan,
        expectation: &ConvergenceExpectation,
    ) -> RunReport {
        let started = Instant::now();
        tracing::info!(run = name, url = %plan.url, "Starting run");

        let mut progress = Progress {
            backend: None,
            consumer: None,
            attempts: None,
            last_observed: None,
        };

        let (outcome, observed) = match self.drive(topology, plan, expectation, &mut progress).await {
            Ok(result) => {
                self.transition(RunState::Asserting);
                (evaluate(Ok(&result), expectation), Some(result))
            }
            Err(e) => {
                tracing::error!(run = name, state = %self.state, "Run aborted: {}", e);
                (TestOutcome::Error(e), progress.last_observed.take())
            }
        };

        if let TestOutcome::Fail(assertion) = &outcome {
            tracing::error!(run = name, "Assertion failed: {}", assertion);
        }
        if !outcome.is_pass() {
            self.transition(RunState::Failed);
        }

        let processes = self.teardown(&mut progress).await;
        remove_scratch_paths(&topology.cleanup);

        if outcome.is_pass() {
            self.transition(RunState::TornDown);
        }

        let elapsed = started.elapsed();
        tracing::info!(run = name, passed = outcome.is_pass(), ?elapsed, "Run finished");

        RunReport {
            name: name.to_string(),
            outcome,
            trace: self.trace,
            attempts: progress.attempts,
            elapsed,
            processes,
            observed,
        }
    }

    /// Run up to the assertion step
    ///
    /// Polling waits until the readiness condition and the expectation both
    /// hold. If the budget runs out on a snapshot that is ready but still
    /// wrong, that snapshot is returned for assertion so the run fails with
    /// observed values instead of a bare timeout.
    async fn drive(
        &mut self,
        topology: &Topology,
        plan: &ProbePlan,
        expectation: &ConvergenceExpectation,
        progress: &mut Progress<L::Handle>,
    ) -> std::result::Result<ProbeResult, Error> {
        self.transition(RunState::Building);
        match &topology.build {
            Some(build) => {
                let artifact = self.launcher.build(build).await?;
                tracing::info!(artifact = %artifact.display(), "Build finished");
            }
            None => tracing::debug!("No build step"),
        }

        self.transition(RunState::BackendStarting);
        progress.backend = Some(self.launcher.launch(&topology.backend).await?);

        self.transition(RunState::ConsumerStarting);
        progress.consumer = Some(self.launcher.launch(&topology.consumer).await?);

        self.transition(RunState::AwaitingConvergence);
        let condition = &plan.condition;
        let converged = wait_for_convergence(
            &self.client,
            &plan.url,
            decode_targets,
            |result: &ProbeResult| condition.is_met(result) && expectation.is_satisfied_by(result),
            &plan.settings,
        )
        .await;

        match converged {
            Ok(converged) => {
                progress.attempts = Some(converged.attempts);
                Ok(converged.value)
            }
            Err(failure) => {
                progress.attempts = Some(failure.error.attempts());
                match failure.last_observed {
                    Some(last) if condition.is_met(&last) => {
                        tracing::warn!(
                            attempts = failure.error.attempts(),
                            "Expectation not met within the budget, asserting on last snapshot"
                        );
                        Ok(last)
                    }
                    last => {
                        progress.last_observed = last;
                        Err(failure.error.into())
                    }
                }
            }
        }
    }

    /// Stop the consumer, then the backend
    async fn teardown(&mut self, progress: &mut Progress<L::Handle>) -> Vec<ProcessSummary> {
        self.launcher.terminate(progress.consumer.as_mut()).await;
        self.launcher.terminate(progress.backend.as_mut()).await;

        [progress.backend.as_ref(), progress.consumer.as_ref()]
            .into_iter()
            .flatten()
            .map(|handle| handle.summary())
            .collect()
    }
}

fn remove_scratch_paths(paths: &[PathBuf]) {
    for path in paths {
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match removed {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed scratch path"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "Failed to remove scratch path: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BuildError, ConvergenceError, LaunchError};
    use crate::launcher::{BuildSpec, LaunchSpec, ProcessState};
    use crate::probe::stub::{unused_port, StubReply, StubServer};
    use crate::probe::{ConvergenceCondition, PollSettings};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const TWO_TARGETS: &str = r#"{"status":"success","data":{"activeTargets":[{"health":"up","labels":{"job":"a"}},{"health":"up","labels":{"job":"b"}}],"droppedTargets":[]}}"#;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Build,
        Launch(String),
        Terminate(String),
    }

    struct FakeHandle {
        name: String,
        pid: u32,
        state: ProcessState,
    }

    impl Handle for FakeHandle {
        fn summary(&self) -> ProcessSummary {
            ProcessSummary {
                name: self.name.clone(),
                pid: Some(self.pid),
                state: self.state,
            }
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        events: Arc<Mutex<Vec<Event>>>,
        fail_build: bool,
        fail_launch: Option<&'static str>,
        next_pid: u32,
    }

    impl RecordingLauncher {
        fn events(&self) -> Arc<Mutex<Vec<Event>>> {
            Arc::clone(&self.events)
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        type Handle = FakeHandle;

        async fn build(&mut self, spec: &BuildSpec) -> std::result::Result<PathBuf, BuildError> {
            self.record(Event::Build);
            if self.fail_build {
                return Err(BuildError::Failed {
                    code: Some(2),
                    output: "undefined: discovery".to_string(),
                });
            }
            Ok(spec.artifact.clone())
        }

        async fn launch(&mut self, spec: &LaunchSpec) -> std::result::Result<FakeHandle, LaunchError> {
            self.record(Event::Launch(spec.name.clone()));
            if self.fail_launch == Some(spec.name.as_str()) {
                return Err(LaunchError::NotFound {
                    name: spec.name.clone(),
                    path: spec.program.clone(),
                });
            }
            self.next_pid += 1;
            Ok(FakeHandle {
                name: spec.name.clone(),
                pid: 1000 + self.next_pid,
                state: ProcessState::Running,
            })
        }

        async fn terminate(&mut self, handle: Option<&mut FakeHandle>) {
            if let Some(handle) = handle {
                if !handle.state.is_exited() {
                    self.record(Event::Terminate(handle.name.clone()));
                    handle.state = ProcessState::Exited { code: None };
                }
            }
        }
    }

    fn topology(cleanup: Vec<PathBuf>) -> Topology {
        Topology {
            build: Some(BuildSpec::go("/src/cmd/consumer", "/tmp/bin/consumer")),
            backend: backend_spec("/opt/consul", Path::new("/tmp/data"), Path::new("/tmp/conf")),
            consumer: consumer_spec("/tmp/bin/consumer", Path::new("/tmp/consumer.yml")),
            cleanup,
        }
    }

    fn plan(url: String, timeout_ms: u64) -> ProbePlan {
        ProbePlan {
            url,
            settings: PollSettings {
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(timeout_ms),
                attempt_timeout: Duration::from_millis(300),
            },
            condition: ConvergenceCondition::default(),
        }
    }

    fn orchestrator(launcher: RecordingLauncher) -> Orchestrator<RecordingLauncher> {
        Orchestrator::new(launcher).unwrap()
    }

    #[tokio::test]
    async fn test_build_failure_starts_nothing() {
        let launcher = RecordingLauncher {
            fail_build: true,
            ..Default::default()
        };
        let events = launcher.events();

        let report = orchestrator(launcher)
            .run(
                "build fails",
                &topology(vec![]),
                &plan("http://127.0.0.1:1/api/v1/targets".to_string(), 100),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        assert!(matches!(report.outcome, TestOutcome::Error(Error::Build(_))));
        assert_eq!(*events.lock().unwrap(), [Event::Build]);
        assert_eq!(report.trace, [RunState::Idle, RunState::Building, RunState::Failed]);
        assert!(report.processes.is_empty());
        assert_eq!(report.attempts, None);
    }

    #[tokio::test]
    async fn test_consumer_launch_failure_tears_down_backend() {
        let launcher = RecordingLauncher {
            fail_launch: Some(CONSUMER),
            ..Default::default()
        };
        let events = launcher.events();

        let report = orchestrator(launcher)
            .run(
                "consumer missing",
                &topology(vec![]),
                &plan("http://127.0.0.1:1/api/v1/targets".to_string(), 100),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        match &report.outcome {
            TestOutcome::Error(Error::Launch(e)) => assert_eq!(e.process_name(), CONSUMER),
            other => panic!("Expected launch error, got {other:?}"),
        }
        assert_eq!(
            *events.lock().unwrap(),
            [
                Event::Build,
                Event::Launch(BACKEND.to_string()),
                Event::Launch(CONSUMER.to_string()),
                Event::Terminate(BACKEND.to_string()),
            ]
        );
        assert_eq!(report.final_state(), Some(RunState::Failed));
        let backend = report.process(BACKEND).unwrap();
        assert!(backend.state.is_exited());
    }

    #[tokio::test]
    async fn test_converged_run_passes_and_tears_down_in_order() {
        let server = StubServer::start(vec![
            StubReply::status(503, "starting"),
            StubReply::ok(r#"{"status":"success","data":{"activeTargets":[],"droppedTargets":[]}}"#),
            StubReply::ok(TWO_TARGETS),
        ])
        .await;
        let launcher = RecordingLauncher::default();
        let events = launcher.events();

        let report = orchestrator(launcher)
            .run(
                "two targets",
                &topology(vec![]),
                &plan(server.url(), 5_000),
                &ConvergenceExpectation::active_targets(2).all_healthy(),
            )
            .await;

        assert!(report.passed(), "{}", report.render());
        assert_eq!(report.attempts, Some(3));
        assert_eq!(report.observed.as_ref().map(ProbeResult::active_count), Some(2));
        assert_eq!(
            report.trace,
            [
                RunState::Idle,
                RunState::Building,
                RunState::BackendStarting,
                RunState::ConsumerStarting,
                RunState::AwaitingConvergence,
                RunState::Asserting,
                RunState::TornDown,
            ]
        );

        let events = events.lock().unwrap();
        assert_eq!(
            events[events.len() - 2..],
            [
                Event::Terminate(CONSUMER.to_string()),
                Event::Terminate(BACKEND.to_string()),
            ]
        );
        assert_eq!(report.processes.len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_target_count_fails_with_observed_value() {
        let server = StubServer::start(vec![StubReply::ok(TWO_TARGETS)]).await;

        let report = orchestrator(RecordingLauncher::default())
            .run(
                "expects three",
                &topology(vec![]),
                &plan(server.url(), 500),
                &ConvergenceExpectation::active_targets(3),
            )
            .await;

        match &report.outcome {
            TestOutcome::Fail(assertion) => {
                let violation = assertion.violation("active_targets").unwrap();
                assert_eq!((violation.expected.as_str(), violation.observed.as_str()), ("3", "2"));
            }
            other => panic!("Expected Fail, got {other:?}"),
        }
        assert_eq!(
            report.trace[report.trace.len() - 2..],
            [RunState::Asserting, RunState::Failed]
        );
        assert!(report.processes.iter().all(|p| p.state.is_exited()));
    }

    #[tokio::test]
    async fn test_partial_membership_is_polled_past() {
        let one_target = r#"{"status":"success","data":{"activeTargets":[{"health":"up"}],"droppedTargets":[]}}"#;
        let server = StubServer::start(vec![
            StubReply::ok(one_target),
            StubReply::ok(one_target),
            StubReply::ok(TWO_TARGETS),
        ])
        .await;

        let report = orchestrator(RecordingLauncher::default())
            .run(
                "gradual discovery",
                &topology(vec![]),
                &plan(server.url(), 5_000),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        assert!(report.passed(), "{}", report.render());
        assert_eq!(report.attempts, Some(3));
        assert_eq!(report.observed.as_ref().map(ProbeResult::active_count), Some(2));
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_snapshot_for_diagnostics() {
        let server = StubServer::start(vec![StubReply::ok(
            r#"{"status":"error","data":{"activeTargets":[{"health":"down"}],"droppedTargets":[]}}"#,
        )])
        .await;

        let report = orchestrator(RecordingLauncher::default())
            .run(
                "never ready",
                &topology(vec![]),
                &plan(server.url(), 300),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        match &report.outcome {
            TestOutcome::Error(Error::Convergence(ConvergenceError::Timeout {
                last_transport_error,
                unsatisfied,
                ..
            })) => {
                assert_eq!(*last_transport_error, None);
                assert!(*unsatisfied >= 1);
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
        let observed = report.observed.as_ref().unwrap();
        assert_eq!(observed.status, "error");
        assert!(report.render().contains("status=error active=1"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_timeout_error() {
        let url = format!("http://127.0.0.1:{}/api/v1/targets", unused_port());
        let started = Instant::now();

        let report = orchestrator(RecordingLauncher::default())
            .run(
                "unreachable",
                &topology(vec![]),
                &plan(url, 400),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        match &report.outcome {
            TestOutcome::Error(Error::Convergence(ConvergenceError::Timeout {
                attempts,
                last_transport_error,
                ..
            })) => {
                assert!(*attempts >= 1);
                assert!(last_transport_error.is_some());
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
        assert!(report.attempts.unwrap() >= 1);
        assert!(report.observed.is_none());
        assert_eq!(
            report.trace[report.trace.len() - 2..],
            [RunState::AwaitingConvergence, RunState::Failed]
        );
        assert!(report.processes.iter().all(|p| p.state.is_exited()));
    }

    #[tokio::test]
    async fn test_scratch_paths_removed_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("consul_data");
        std::fs::create_dir_all(data_dir.join("raft")).unwrap();
        let artifact = dir.path().join("consumer");
        std::fs::write(&artifact, b"binary").unwrap();
        let never_created = dir.path().join("missing");

        let server = StubServer::start(vec![StubReply::ok(TWO_TARGETS)]).await;
        let report = orchestrator(RecordingLauncher::default())
            .run(
                "cleanup",
                &topology(vec![data_dir.clone(), artifact.clone(), never_created]),
                &plan(server.url(), 5_000),
                &ConvergenceExpectation::active_targets(2),
            )
            .await;

        assert!(report.passed());
        assert!(!data_dir.exists());
        assert!(!artifact.exists());
    }

    #[test]
    fn test_new_orchestrator_is_idle() {
        let orchestrator = orchestrator(RecordingLauncher::default());
        assert_eq!(orchestrator.state(), RunState::Idle);
    }
}
