//! The fixed run topology: one discovery backend, one consumer, one probe

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::launcher::{BuildSpec, LaunchSpec};
use crate::probe::{ConvergenceCondition, PollSettings};

/// Process name of the discovery backend
pub const BACKEND: &str = "backend";
/// Process name of the consumer
pub const CONSUMER: &str = "consumer";

/// Flag the consumer takes its configuration file through
pub const CONSUMER_CONFIG_FLAG: &str = "--config.file";

/// Hosts that must bypass any proxy when the consumer talks to the backend
pub const NO_PROXY_HOSTS: &str = "localhost,127.0.0.1,0.0.0.0,:";

/// What to build and launch for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Optional build step producing the consumer executable
    pub build: Option<BuildSpec>,
    pub backend: LaunchSpec,
    pub consumer: LaunchSpec,
    /// Scratch paths removed after teardown
    pub cleanup: Vec<PathBuf>,
}

/// Where and how to wait for convergence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    pub url: String,
    pub settings: PollSettings,
    pub condition: ConvergenceCondition,
}

/// Proxy bypass variables for a child talking to loopback services
pub fn no_proxy_env() -> BTreeMap<String, String> {
    ["no_proxy", "NO_PROXY"]
        .into_iter()
        .map(|key| (key.to_string(), NO_PROXY_HOSTS.to_string()))
        .collect()
}

/// Single-node discovery backend in bootstrap mode
pub fn backend_spec(program: impl Into<PathBuf>, data_dir: &Path, config_dir: &Path) -> LaunchSpec {
    LaunchSpec::new(BACKEND, program).args([
        "agent".to_string(),
        "-server".to_string(),
        "-bind=127.0.0.1".to_string(),
        "-bootstrap-expect=1".to_string(),
        format!("-data-dir={}", data_dir.display()),
        format!("-config-dir={}", config_dir.display()),
    ])
}

/// Consumer pointed at its configuration file, with proxies bypassed
pub fn consumer_spec(program: impl Into<PathBuf>, config_file: &Path) -> LaunchSpec {
    let mut spec = LaunchSpec::new(CONSUMER, program)
        .arg(format!("{}={}", CONSUMER_CONFIG_FLAG, config_file.display()));
    spec.env = no_proxy_env();
    spec
}

impl Topology {
    /// Consul backend and a Prometheus consumer built from source
    ///
    /// Binaries, backend data and backend configuration live under
    /// `testdata`; the data directory and built binary are cleaned up after
    /// the run.
    pub fn consul_prometheus(testdata: &Path, source_dir: &Path, config_file: &Path) -> Self {
        let artifact = testdata.join("prometheus");
        let data_dir = testdata.join("consul_data");

        Self {
            build: Some(BuildSpec::go(source_dir, &artifact)),
            backend: backend_spec(testdata.join("consul"), &data_dir, &testdata.join("consul.d")),
            consumer: consumer_spec(&artifact, config_file),
            cleanup: vec![data_dir, artifact],
        }
    }
}
