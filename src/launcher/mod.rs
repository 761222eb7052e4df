//! Process Launcher
//!
//! Starts, builds and stops the external processes of a run. The
//! orchestrator talks to them through the [`Launcher`] trait so its
//! sequencing can be checked without real processes.

mod build;
mod process;

use std::path::PathBuf;

use async_trait::async_trait;

pub use build::{run_build, BuildSpec};
pub use process::{
    launch, resolve_executable, terminate, LaunchSettings, LaunchSpec, OutputMode, ProcessHandle,
    ProcessState, TeardownSettings,
};

use crate::common::{BuildError, LaunchError};

/// Snapshot of a handle kept for the run report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub name: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
}

/// Anything the orchestrator can hold as a process handle
pub trait Handle: Send {
    fn summary(&self) -> ProcessSummary;
}

impl Handle for ProcessHandle {
    fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            name: self.name().to_string(),
            pid: self.pid(),
            state: self.state(),
        }
    }
}

/// Builds, starts and stops the processes of a run
#[async_trait]
pub trait Launcher: Send {
    type Handle: Handle;

    /// Run the build step, returning the artifact path
    async fn build(&mut self, spec: &BuildSpec) -> Result<PathBuf, BuildError>;

    /// Start a process
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Handle, LaunchError>;

    /// Stop a process; must be a no-op for `None` or an exited handle
    async fn terminate(&mut self, handle: Option<&mut Self::Handle>);
}

/// Launcher backed by real OS processes
#[derive(Debug, Clone, Default)]
pub struct SystemLauncher {
    launch: LaunchSettings,
    teardown: TeardownSettings,
}

impl SystemLauncher {
    pub fn new(launch: LaunchSettings, teardown: TeardownSettings) -> Self {
        Self { launch, teardown }
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    type Handle = ProcessHandle;

    async fn build(&mut self, spec: &BuildSpec) -> Result<PathBuf, BuildError> {
        run_build(spec).await
    }

    async fn launch(&mut self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        launch(spec, &self.launch).await
    }

    async fn terminate(&mut self, handle: Option<&mut ProcessHandle>) {
        terminate(handle, &self.teardown).await
    }
}
