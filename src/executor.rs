//! Process execution seam.
//!
//! Every runner talks to the container backend through [`ProcessExecutor`]:
//! one external command in, one fully populated [`PhaseResult`] out. Launch
//! failures and timeouts are folded into the result instead of being raised,
//! so a missing backend is an ordinary (if terminal) outcome for the caller.

mod process;

pub use process::{TokioExecutor, OUTPUT_LIMIT_BYTES};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Exit code reported when no real exit code applies (timeout, launch failure).
pub const NO_EXIT_CODE: i32 = -1;

/// Exit code reported when a request is rejected before anything runs.
pub const REJECTED_EXIT_CODE: i32 = -100;

/// A single external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
    /// Kill the process once this much time has elapsed.
    pub timeout: Option<Duration>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Space-joined command line, for logs only.
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }
}

/// Why a command never produced an exit status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Command not found: {program}")]
    NotFound { program: String },

    #[error("An unexpected error occurred running command: {message}")]
    Io { program: String, message: String },
}

impl LaunchError {
    pub(crate) fn from_io(program: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                program: program.to_string(),
            }
        } else {
            Self::Io {
                program: program.to_string(),
                message: format!("{program}: {err}"),
            }
        }
    }
}

/// Outcome of one phase (build or run) of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or [`NO_EXIT_CODE`] when none applies.
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(skip)]
    launch_error: Option<LaunchError>,
}

impl PhaseResult {
    /// A process that ran and exited on its own.
    pub fn completed(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            timed_out: false,
            launch_error: None,
        }
    }

    /// A process killed after exceeding `limit`. Whatever output was captured
    /// is kept and a marker line is appended to stderr.
    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>, limit: Duration) -> Self {
        let mut stderr = stderr.into();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Command timed out after {} seconds.",
            format_seconds(limit)
        ));
        Self {
            stdout: stdout.into(),
            stderr,
            exit_code: NO_EXIT_CODE,
            timed_out: true,
            launch_error: None,
        }
    }

    /// A process that could not be started or waited on.
    pub fn launch_failure(err: LaunchError) -> Self {
        Self {
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: NO_EXIT_CODE,
            timed_out: false,
            launch_error: Some(err),
        }
    }

    /// Keep output captured before a launch failure; the failure message
    /// follows any captured stderr.
    #[must_use]
    pub(crate) fn with_captured(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        if !stderr.is_empty() {
            let mut combined = stderr;
            if !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
            self.stderr = combined;
        }
        self
    }

    /// Input rejected before any process was started.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::completed(String::new(), reason, REJECTED_EXIT_CODE)
    }

    pub const fn launch_error(&self) -> Option<&LaunchError> {
        self.launch_error.as_ref()
    }

    /// Exited with code 0 and did not time out.
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Renders whole seconds without a fraction ("5"), otherwise one decimal ("0.5").
pub(crate) fn format_seconds(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}

/// Runs external commands on behalf of the runners.
///
/// Implementations must never panic or return early without a result:
/// spawn failures become [`PhaseResult::launch_failure`] and timeouts become
/// [`PhaseResult::timed_out`]. One call spawns at most one child process and
/// never retries.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn execute(&self, command: &CommandSpec) -> PhaseResult;
}

#[async_trait]
impl<T: ProcessExecutor + ?Sized> ProcessExecutor for std::sync::Arc<T> {
    async fn execute(&self, command: &CommandSpec) -> PhaseResult {
        (**self).execute(command).await
    }
}
