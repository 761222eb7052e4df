//! External process handles
//!
//! A [`ProcessHandle`] owns one child process for the lifetime of a run.
//! Termination is idempotent: it checks liveness before signalling, bounds
//! every wait, and never reports an error, so teardown can run unconditionally.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::common::LaunchError;

/// How a process should be started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Role of the process in the run ("backend", "consumer"); used for logs
    pub name: String,
    /// Executable path, or a bare name resolved on `PATH`
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Variables added to the inherited environment of this child only
    pub env: BTreeMap<String, String>,
    /// Variables removed from the inherited environment of this child only
    pub env_remove: Vec<String>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            env_remove: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Where child stdout/stderr goes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputMode {
    Inherit,
    #[default]
    Null,
    /// Append both streams to `<dir>/<name>.log`
    LogFile(PathBuf),
}

/// Launcher behaviour shared by every process of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    /// A process that exits within this window fails the launch
    pub startup_grace: Duration,
    pub output: OutputMode,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(200),
            output: OutputMode::Null,
        }
    }
}

/// Bounds on how long termination may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownSettings {
    /// Wait after SIGTERM before force-killing
    pub grace: Duration,
    /// Wait after the forced kill before giving up on reaping
    pub reap_timeout: Duration,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            reap_timeout: Duration::from_secs(2),
        }
    }
}

/// Liveness of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    /// `code` is `None` when the process was ended by a signal or could not be reaped
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

/// An external process owned by the orchestrator
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    args: Vec<String>,
    pid: Option<u32>,
    state: ProcessState,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last observed state, without polling the OS
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Poll the OS for exit and return the updated state
    pub fn refresh(&mut self) -> ProcessState {
        if self.state.is_exited() {
            return self.state;
        }
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => self.state = exited(Some(status)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(process = %self.name, "Failed to poll process status: {}", e);
                }
            }
        }
        self.state
    }

    /// Stop the process
    ///
    /// Sends SIGTERM, waits up to `settings.grace`, then force-kills and
    /// reaps within `settings.reap_timeout`. Calling this on an exited
    /// process, or a second time, does nothing.
    pub async fn terminate(&mut self, settings: &TeardownSettings) {
        if self.refresh().is_exited() {
            tracing::debug!(process = %self.name, state = ?self.state, "Process already exited");
            return;
        }

        let status = match self.child.as_mut() {
            Some(child) => shutdown_child(&self.name, child, settings).await,
            None => None,
        };

        self.state = exited(status);
        tracing::info!(process = %self.name, pid = ?self.pid, state = ?self.state, "Process stopped");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Last resort when teardown never ran
        if !self.state.is_exited() {
            if let Some(child) = self.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

fn exited(status: Option<ExitStatus>) -> ProcessState {
    ProcessState::Exited {
        code: status.and_then(|s| s.code()),
    }
}

/// Stop a process that may be absent
///
/// A `None` handle is a no-op so teardown can run before anything started.
pub async fn terminate(handle: Option<&mut ProcessHandle>, settings: &TeardownSettings) {
    if let Some(handle) = handle {
        handle.terminate(settings).await;
    }
}

async fn shutdown_child(
    name: &str,
    child: &mut Child,
    settings: &TeardownSettings,
) -> Option<ExitStatus> {
    if request_stop(child) {
        match timeout(settings.grace, child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => tracing::warn!(process = %name, "Wait after SIGTERM failed: {}", e),
            Err(_) => tracing::warn!(
                process = %name,
                "Process ignored SIGTERM for {:?}, killing",
                settings.grace
            ),
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(process = %name, "Kill failed (process likely gone): {}", e);
    }

    match timeout(settings.reap_timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(process = %name, "Failed to reap process: {}", e);
            None
        }
        Err(_) => {
            tracing::warn!(
                process = %name,
                "Process not reaped within {:?} after kill",
                settings.reap_timeout
            );
            None
        }
    }
}

/// Ask the process to exit gracefully. Returns false if no signal was sent.
#[cfg(unix)]
fn request_stop(child: &mut Child) -> bool {
    match child.id() {
        // SAFETY: kill(2) with a PID we own has no memory-safety implications
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &mut Child) -> bool {
    false
}

/// Resolve the program of a spec to an executable path
pub fn resolve_executable(spec: &LaunchSpec) -> Result<PathBuf, LaunchError> {
    let program = &spec.program;
    let is_bare_name = program.components().count() == 1 && !program.is_absolute();

    let path = if is_bare_name {
        which::which(program).map_err(|_| LaunchError::NotFound {
            name: spec.name.clone(),
            path: program.clone(),
        })?
    } else if program.is_relative() {
        match &spec.working_dir {
            Some(dir) => dir.join(program),
            None => program.clone(),
        }
    } else {
        program.clone()
    };

    let metadata = std::fs::metadata(&path).map_err(|_| LaunchError::NotFound {
        name: spec.name.clone(),
        path: path.clone(),
    })?;

    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(LaunchError::NotExecutable {
            name: spec.name.clone(),
            path,
        });
    }

    Ok(path.canonicalize().unwrap_or(path))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

fn output_stdio(spec: &LaunchSpec, mode: &OutputMode) -> Result<(Stdio, Stdio), LaunchError> {
    match mode {
        OutputMode::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
        OutputMode::Null => Ok((Stdio::null(), Stdio::null())),
        OutputMode::LogFile(dir) => {
            let path = dir.join(format!("{}.log", spec.name));
            let log_error = |source| LaunchError::OutputLog {
                name: spec.name.clone(),
                path: path.clone(),
                source,
            };

            std::fs::create_dir_all(dir).map_err(log_error)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(log_error)?;
            let err_file = file.try_clone().map_err(log_error)?;
            Ok((Stdio::from(file), Stdio::from(err_file)))
        }
    }
}

/// Start an external process
///
/// Fails if the executable is missing or not executable, if the OS refuses
/// to start it, or if it exits within the startup grace period.
pub async fn launch(spec: &LaunchSpec, settings: &LaunchSettings) -> Result<ProcessHandle, LaunchError> {
    let program = resolve_executable(spec)?;

    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(LaunchError::MissingWorkingDir {
                name: spec.name.clone(),
                path: dir.clone(),
            });
        }
    }

    let (stdout, stderr) = output_stdio(spec, &settings.output)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);
    for key in &spec.env_remove {
        cmd.env_remove(key);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    tracing::debug!(process = %spec.name, program = %program.display(), args = ?spec.args, "Launching");

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        name: spec.name.clone(),
        path: program.clone(),
        source,
    })?;

    let mut handle = ProcessHandle {
        name: spec.name.clone(),
        args: spec.args.clone(),
        pid: child.id(),
        state: ProcessState::Starting,
        child: Some(child),
    };

    if !settings.startup_grace.is_zero() {
        if let Some(child) = handle.child.as_mut() {
            match timeout(settings.startup_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    handle.state = exited(Some(status));
                    return Err(LaunchError::ExitedEarly {
                        name: spec.name.clone(),
                        code: status.code(),
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(process = %spec.name, "Failed to watch startup: {}", e);
                }
                Err(_) => {}
            }
        }
    }

    handle.state = ProcessState::Running;
    tracing::info!(process = %spec.name, pid = ?handle.pid, "Process started");

    Ok(handle)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn quick_teardown() -> TeardownSettings {
        TeardownSettings {
            grace: Duration::from_secs(2),
            reap_timeout: Duration::from_secs(2),
        }
    }

    fn no_grace() -> LaunchSettings {
        LaunchSettings {
            startup_grace: Duration::ZERO,
            output: OutputMode::Null,
        }
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let spec = LaunchSpec::new("backend", "/nonexistent/discovery-backend");
        let err = launch(&spec, &no_grace()).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }), "{err}");
        assert_eq!(err.process_name(), "backend");
    }

    #[tokio::test]
    async fn test_bare_name_not_on_path() {
        let spec = LaunchSpec::new("backend", "definitely-not-a-real-binary-4711");
        let err = launch(&spec, &no_grace()).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("consumer");
        std::fs::write(&file, "plain data").unwrap();

        let spec = LaunchSpec::new("consumer", &file);
        let err = launch(&spec, &no_grace()).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotExecutable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_directory_is_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("consumer", dir.path());
        let err = launch(&spec, &no_grace()).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotExecutable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let spec = LaunchSpec::new("backend", "sleep")
            .arg("5")
            .working_dir("/nonexistent/workdir");
        let err = launch(&spec, &no_grace()).await.unwrap_err();
        assert!(matches!(err, LaunchError::MissingWorkingDir { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_exit_during_startup_grace() {
        let spec = LaunchSpec::new("consumer", "sh")
            .args(["-c", "exit $EXIT_CODE"])
            .env("EXIT_CODE", "7");
        let settings = LaunchSettings {
            startup_grace: Duration::from_secs(5),
            output: OutputMode::Null,
        };

        let err = launch(&spec, &settings).await.unwrap_err();
        match err {
            LaunchError::ExitedEarly { name, code } => {
                assert_eq!(name, "consumer");
                assert_eq!(code, Some(7));
            }
            other => panic!("Expected ExitedEarly, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_env_removal_is_scoped_to_child() {
        let mut spec = LaunchSpec::new("consumer", "sh")
            .args(["-c", "test -z \"$HTTP_PROXY\" && exit 3; exit 4"]);
        spec.env_remove.push("HTTP_PROXY".to_string());
        let settings = LaunchSettings {
            startup_grace: Duration::from_secs(5),
            output: OutputMode::Null,
        };

        let err = launch(&spec, &settings).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly { code: Some(3), .. }), "{err}");
    }

    #[tokio::test]
    async fn test_running_process_terminates_and_is_idempotent() {
        let spec = LaunchSpec::new("backend", "sleep").arg("30");
        let settings = LaunchSettings {
            startup_grace: Duration::from_millis(100),
            output: OutputMode::Null,
        };

        let mut handle = launch(&spec, &settings).await.unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.pid().is_some());
        assert_eq!(handle.args(), ["30"]);

        let started = Instant::now();
        handle.terminate(&quick_teardown()).await;
        assert!(handle.state().is_exited());

        handle.terminate(&quick_teardown()).await;
        terminate(Some(&mut handle), &quick_teardown()).await;
        assert!(handle.state().is_exited());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_terminate_after_process_exited_on_its_own() {
        let spec = LaunchSpec::new("consumer", "sh").args(["-c", "exit 0"]);
        let mut handle = launch(&spec, &no_grace()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.terminate(&quick_teardown()).await;
        assert_eq!(handle.state(), ProcessState::Exited { code: Some(0) });

        handle.terminate(&quick_teardown()).await;
        assert_eq!(handle.state(), ProcessState::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_process_ignoring_sigterm_is_killed() {
        let spec = LaunchSpec::new("backend", "sh").args(["-c", "trap '' TERM; sleep 30 & wait"]);
        let mut handle = launch(&spec, &no_grace()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let settings = TeardownSettings {
            grace: Duration::from_millis(300),
            reap_timeout: Duration::from_secs(2),
        };
        let started = Instant::now();
        handle.terminate(&settings).await;

        assert_eq!(handle.state(), ProcessState::Exited { code: None });
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_terminate_none_is_noop() {
        terminate(None, &quick_teardown()).await;
    }

    #[tokio::test]
    async fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("consumer", "sh").args(["-c", "echo ready; echo oops >&2"]);
        let settings = LaunchSettings {
            startup_grace: Duration::ZERO,
            output: OutputMode::LogFile(dir.path().join("logs")),
        };

        let mut handle = launch(&spec, &settings).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.terminate(&quick_teardown()).await;

        let log = std::fs::read_to_string(dir.path().join("logs").join("consumer.log")).unwrap();
        assert!(log.contains("ready"));
        assert!(log.contains("oops"));
    }
}
