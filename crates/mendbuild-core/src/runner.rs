//! Build command execution.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::env::EnvironmentState;

/// Captured result of one child process execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Exit code; `None` when the process never ran, timed out, or was
    /// killed by a signal.
    pub exit_code: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,
}

impl CapturedOutput {
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// A failure with no exit code, described on stderr.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
        }
    }
}

/// Outcome of handing a command to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Completed(CapturedOutput),
    Cancelled,
}

/// One build attempt, immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAttempt {
    /// 1-based attempt index within a run.
    pub index: u32,

    /// Rendered command line.
    pub command: String,

    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl BuildAttempt {
    pub fn new(index: u32, spec: &CommandSpec, captured: CapturedOutput, duration_ms: u64) -> Self {
        Self {
            index,
            command: spec.display(),
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined stdout and stderr, the text fix rules are matched against.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr),
        }
    }
}

/// Runs a build command under an explicit environment.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CommandSpec,
        env: &EnvironmentState,
        cancel: &CancellationToken,
    ) -> Execution;
}

/// Executes commands as tokio child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        env: &EnvironmentState,
        cancel: &CancellationToken,
    ) -> Execution {
        let Some(program) = spec.program() else {
            return Execution::Completed(CapturedOutput::failed("empty command"));
        };

        let mut cmd = Command::new(program);
        cmd.args(spec.args())
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout or cancel reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Execution::Completed(CapturedOutput::failed(format!(
                    "{}: command not found ({})",
                    program, e
                )));
            }
            Err(e) => {
                return Execution::Completed(CapturedOutput::failed(format!(
                    "failed to spawn {}: {}",
                    program, e
                )));
            }
        };
        debug!(command = %spec.name, pid = ?child.id(), "spawned build command");

        let stdout = child.stdout.take().map(read_pipe);
        let stderr = child.stderr.take().map(read_pipe);

        let timeout_secs = spec.timeout_secs;
        let deadline = async move {
            if timeout_secs > 0 {
                sleep(Duration::from_secs(timeout_secs)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = deadline => Some(None),
            status = child.wait() => Some(Some(status)),
        };

        match status {
            Some(Some(Ok(status))) => Execution::Completed(CapturedOutput {
                exit_code: status.code(),
                stdout: collect_pipe(stdout).await,
                stderr: collect_pipe(stderr).await,
            }),
            Some(Some(Err(e))) => {
                kill_tree(&mut child).await;
                abort_pipes([stdout, stderr]);
                Execution::Completed(CapturedOutput::failed(format!(
                    "failed to wait for {}: {}",
                    program, e
                )))
            }
            Some(None) => {
                warn!(command = %spec.name, timeout_secs, "build command timed out");
                kill_tree(&mut child).await;
                abort_pipes([stdout, stderr]);
                Execution::Completed(CapturedOutput::failed(format!(
                    "{} timed out after {} seconds",
                    spec.name, timeout_secs
                )))
            }
            None => {
                kill_tree(&mut child).await;
                abort_pipes([stdout, stderr]);
                Execution::Cancelled
            }
        }
    }
}

/// Drain a child pipe on its own task so a full pipe never blocks the child.
fn read_pipe<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "child pipe read failed");
        }
        buf
    })
}

async fn collect_pipe(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    match reader {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

fn abort_pipes(readers: [Option<JoinHandle<Vec<u8>>>; 2]) {
    for reader in readers.into_iter().flatten() {
        reader.abort();
    }
}

/// SIGKILL the child's process group, then reap the child itself.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "failed to kill process group"),
        }
    }
    // Already dead after killpg; covers platforms without process groups.
    let _ = child.kill().await;
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap build command");
    }
}

/// Run `spec` once and wrap the capture as attempt `index`.
///
/// Returns `None` when the run was cancelled.
pub async fn run_attempt(
    executor: &dyn CommandExecutor,
    index: u32,
    spec: &CommandSpec,
    env: &EnvironmentState,
    cancel: &CancellationToken,
) -> Option<BuildAttempt> {
    let start = Instant::now();
    match executor.execute(spec, env, cancel).await {
        Execution::Completed(captured) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            Some(BuildAttempt::new(index, spec, captured, duration_ms))
        }
        Execution::Cancelled => None,
    }
}
