//! Consumer build step
//!
//! Runs the build command to completion and checks that it produced the
//! expected artifact. There is no fallback: any failure aborts the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::common::BuildError;

/// Lines of build output kept in a failure report
const OUTPUT_TAIL_LINES: usize = 40;

/// A build command and the executable it must produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Executable the build must produce
    pub artifact: PathBuf,
}

impl BuildSpec {
    /// `go build -o <artifact> <source_dir>`
    pub fn go(source_dir: impl AsRef<Path>, artifact: impl Into<PathBuf>) -> Self {
        let artifact = artifact.into();
        Self {
            program: "go".to_string(),
            args: vec![
                "build".to_string(),
                "-o".to_string(),
                artifact.display().to_string(),
                source_dir.as_ref().display().to_string(),
            ],
            working_dir: None,
            env: BTreeMap::new(),
            artifact,
        }
    }
}

/// Run a build and return the path of the produced artifact
pub async fn run_build(spec: &BuildSpec) -> Result<PathBuf, BuildError> {
    let artifact = match (&spec.working_dir, spec.artifact.is_relative()) {
        (Some(dir), true) => dir.join(&spec.artifact),
        _ => spec.artifact.clone(),
    };

    if let Some(parent) = artifact.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| BuildError::Prepare {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    tracing::info!(program = %spec.program, args = ?spec.args, "Building consumer");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|source| BuildError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(BuildError::Failed {
            code: output.status.code(),
            output: tail_lines(&combined, OUTPUT_TAIL_LINES),
        });
    }

    if !artifact.is_file() {
        return Err(BuildError::MissingArtifact { path: artifact });
    }

    tracing::info!(artifact = %artifact.display(), "Build finished");
    Ok(artifact)
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
