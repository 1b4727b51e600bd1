//! Host process executor.
//!
//! Spawns the command with tokio, drains stdout/stderr concurrently into
//! shared buffers and enforces the timeout by killing the child. Because the
//! buffers live outside the reader tasks, output produced before a timeout
//! is still returned. Each stream is capped at [`OUTPUT_LIMIT_BYTES`].

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{CommandSpec, LaunchError, PhaseResult, ProcessExecutor, NO_EXIT_CODE};

/// How long pipe readers may keep draining after the child is gone.
///
/// A grandchild that inherited the pipes can keep them open indefinitely;
/// past this point whatever was read is returned.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Bytes kept per stream. Readers keep draining past this so the child
/// never blocks on a full pipe, but the excess is dropped.
pub const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type Buffer = Arc<Mutex<Capture>>;

/// Executor that runs commands as host child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl TokioExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessExecutor for TokioExecutor {
    #[instrument(skip(self, command), fields(program = %command.program, timeout = ?command.timeout))]
    async fn execute(&self, command: &CommandSpec) -> PhaseResult {
        debug!(cmd = %command.display(), "Spawning process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = LaunchError::from_io(&command.program, &e);
                warn!(error = %err, "Failed to spawn process");
                return PhaseResult::launch_failure(err);
            }
        };

        // Feed stdin from its own task so a child that never reads cannot
        // block us; dropping the handle closes the pipe.
        if let (Some(input), Some(mut pipe)) = (command.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        let stdout_buf = Buffer::default();
        let stderr_buf = Buffer::default();
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stderr_buf))));

        let waited = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed out process");
                    }
                    None
                }
            },
            None => Some(child.wait().await),
        };

        let deadline = tokio::time::Instant::now() + OUTPUT_GRACE;
        settle(stdout_task, deadline).await;
        settle(stderr_task, deadline).await;

        let stdout = take_lossy(&stdout_buf).await;
        let stderr = take_lossy(&stderr_buf).await;

        match waited {
            None => {
                // `waited` is only None when a timeout was configured.
                let limit = command.timeout.unwrap_or_default();
                warn!(?limit, "Process timed out");
                PhaseResult::timed_out(stdout, stderr, limit)
            }
            Some(Ok(status)) => {
                let exit_code = exit_code(status);
                debug!(exit_code, "Process completed");
                PhaseResult::completed(stdout, stderr, exit_code)
            }
            Some(Err(e)) => {
                let err = LaunchError::from_io(&command.program, &e);
                warn!(error = %err, "Failed to wait for process");
                PhaseResult::launch_failure(err).with_captured(stdout, stderr)
            }
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Buffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut sink = sink.lock().await;
                let room = OUTPUT_LIMIT_BYTES.saturating_sub(sink.bytes.len());
                if n > room {
                    sink.truncated = true;
                }
                sink.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "Pipe read failed");
                break;
            }
        }
    }
}

async fn settle(task: Option<JoinHandle<()>>, deadline: tokio::time::Instant) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
        debug!("Output pipe still open after grace period, abandoning reader");
        task.abort();
    }
}

async fn take_lossy(buf: &Buffer) -> String {
    let capture = std::mem::take(&mut *buf.lock().await);
    let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
    if capture.truncated {
        text.push_str(&format!("\n[output truncated after {OUTPUT_LIMIT_BYTES} bytes]"));
    }
    text
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(NO_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(NO_EXIT_CODE)
}
