//! Language runners.
//!
//! Each runner drives the same state machine over a [`ProcessExecutor`]:
//!
//! ```text
//! STAGING -> BUILDING -> (BUILD_FAILED | BUILD_TIMED_OUT | RUNNING)
//!         -> (RUN_SUCCEEDED | RUN_FAILED | RUN_TIMED_OUT) -> CLEANUP
//! ```
//!
//! Staging rejects bad input before any workspace or backend work, with
//! [`REJECTED_EXIT_CODE`](crate::executor::REJECTED_EXIT_CODE). Python and
//! Go build a per-execution image (see `image`); C++ compiles inside the
//! toolchain's base image. Runners
//! never return `Err`: backend trouble goes into the `error` field and
//! user-code failures into the phase fields.

mod cpp;
mod go;
mod image;
mod python;

#[cfg(test)]
pub(crate) mod test_support;

pub use cpp::{Compiler, CompilerError, CppExecution, CppRequest};
pub use go::GoRequest;
pub use python::PythonRequest;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::executor::{CommandSpec, PhaseResult, ProcessExecutor, NO_EXIT_CODE};
use crate::limits::ResourceLimits;
use crate::sandbox::DockerCli;
use crate::workspace::{Workspace, WorkspaceError};

/// Exit code reported for a run killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 137;

/// Executes untrusted code through the container backend.
///
/// Holds no per-execution state; share it behind an `Arc` to serve
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct SandboxRunner<E> {
    executor: E,
    docker: DockerCli,
    build_timeout: Duration,
    cleanup_timeout: Duration,
    workspace_root: Option<PathBuf>,
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    pub fn new(executor: E, config: &Config) -> Self {
        Self {
            executor,
            docker: DockerCli::new(config.backend.docker_binary.clone()),
            build_timeout: config.backend.build_timeout(),
            cleanup_timeout: config.backend.cleanup_timeout(),
            workspace_root: config.workspace_root.clone(),
        }
    }

    fn workspace(&self, prefix: &str) -> Result<Workspace, WorkspaceError> {
        Workspace::create(self.workspace_root.as_deref(), prefix)
    }

    /// Run a `docker run` command. A timed out container is force-removed by
    /// name, since killing the CLI client leaves it running.
    async fn execute_container(&self, spec: &CommandSpec, container: &str) -> PhaseResult {
        let result = self.executor.execute(spec).await;
        if result.timed_out {
            let rm = self
                .executor
                .execute(&self.docker.remove_container(container, self.cleanup_timeout))
                .await;
            if rm.succeeded() {
                debug!(container, "Removed timed out container");
            } else {
                warn!(container, stderr = %rm.stderr.trim(), "Failed to remove timed out container");
            }
        }
        result
    }

    /// Best-effort `docker rmi -f`; failures are only logged.
    async fn remove_image(&self, tag: &str) {
        let result = self
            .executor
            .execute(&self.docker.remove_image(tag, self.cleanup_timeout))
            .await;
        if result.succeeded() {
            debug!(image = tag, "Removed image");
        } else {
            warn!(
                image = tag,
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "Failed to remove image"
            );
        }
    }
}

/// Checks shared by every runner's staging step.
fn validate_common(code: &str, timeout: Duration, limits: &ResourceLimits) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("No source code provided.".into());
    }
    if timeout.is_zero() {
        return Err("Timeout must be greater than zero.".into());
    }
    limits
        .validate()
        .map_err(|e| format!("Invalid resource limits: {e}"))
}

/// Check a Docker image reference before it reaches a Dockerfile `FROM`
/// line or a `docker run` argument list.
pub(crate) fn validate_image(image: &str) -> Result<(), String> {
    if image.trim().is_empty() {
        return Err("Base image must not be empty.".into());
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '/' | '@');
    if image.starts_with(['-', '.', ':', '/', '@']) || !image.chars().all(allowed) {
        return Err(format!("Invalid base image reference: {image:?}"));
    }
    Ok(())
}

/// A timed out run never reports a clean-looking exit code.
fn normalize_timeout_exit(result: &mut PhaseResult) {
    if result.timed_out && matches!(result.exit_code, 0 | NO_EXIT_CODE) {
        result.exit_code = TIMEOUT_EXIT_CODE;
    }
}

/// Result of an image-build execution (Python, Go).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "ScriptReport")]
pub struct ScriptExecution {
    /// Image build phase, or the staging diagnostic when nothing was built.
    pub build: PhaseResult,
    /// Container run phase; `None` when the program never ran.
    pub run: Option<PhaseResult>,
    /// Infrastructure failure (backend missing, workspace, image build).
    pub error: Option<String>,
}

impl ScriptExecution {
    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        Self {
            build: PhaseResult::rejected(reason),
            run: None,
            error: None,
        }
    }

    pub(crate) fn infrastructure(message: String) -> Self {
        Self {
            build: PhaseResult::completed(String::new(), message.clone(), NO_EXIT_CODE),
            run: None,
            error: Some(message),
        }
    }

    pub const fn ran(&self) -> bool {
        self.run.is_some()
    }

    /// The program ran to completion with exit code 0.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.run.as_ref().is_some_and(PhaseResult::succeeded)
    }

    /// Flat `{stdout, stderr, exit_code, timed_out, error}` view. Before the
    /// run phase it reports the build phase, with a failed build's output
    /// labelled by stream.
    pub fn summary(&self) -> ScriptSummary {
        let (stdout, stderr, exit_code, timed_out) = match &self.run {
            Some(run) => (run.stdout.clone(), run.stderr.clone(), run.exit_code, run.timed_out),
            None => {
                let build = &self.build;
                let stderr = if build.exit_code > 0 && !build.timed_out {
                    format!(
                        "Build STDOUT:\n{}\n\nBuild STDERR:\n{}",
                        build.stdout, build.stderr
                    )
                } else {
                    build.stderr.clone()
                };
                (String::new(), stderr, build.exit_code, build.timed_out)
            }
        };
        ScriptSummary {
            stdout,
            stderr,
            exit_code,
            timed_out,
            error: self.error.clone(),
        }
    }
}

/// Flat result record for image-build runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptSummary {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Serialized form: the flat summary plus both phases.
#[derive(Serialize)]
struct ScriptReport {
    #[serde(flatten)]
    summary: ScriptSummary,
    build: PhaseResult,
    run: Option<PhaseResult>,
}

impl From<ScriptExecution> for ScriptReport {
    fn from(execution: ScriptExecution) -> Self {
        Self {
            summary: execution.summary(),
            build: execution.build,
            run: execution.run,
        }
    }
}
