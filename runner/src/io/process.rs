//! Helpers for running short-lived child processes with timeouts and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the caller raised its cancel flag.
    pub cancelled: bool,
}

/// How often a running child checks its cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
pub fn run_command_with_timeout(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_cancellable(cmd, timeout, output_limit_bytes, &AtomicBool::new(false))
}

/// Like [`run_command_with_timeout`], but the child is also killed once `cancel` is set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_cancellable(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &AtomicBool,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            break kill_and_wait(&mut child)?;
        }
        if cancel.load(Ordering::SeqCst) {
            info!("command cancelled, killing");
            cancelled = true;
            break kill_and_wait(&mut child)?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(CANCEL_POLL))
            .context("wait for command")?
        {
            break status;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

/// Outcome of the project's initialization script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Run `script` with `sh -c` inside `workdir`.
///
/// Spawn failures, non-zero exits, timeouts, and cancellation all yield
/// `success: false` with a readable error.
#[instrument(skip_all, fields(workdir = %workdir.display()))]
pub fn run_init_script(
    script: &str,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &AtomicBool,
) -> ScriptOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    match run_command_cancellable(cmd, timeout, output_limit_bytes, cancel) {
        Ok(output) if output.success() => ScriptOutcome {
            success: true,
            error: None,
        },
        Ok(output) if output.cancelled => ScriptOutcome {
            success: false,
            error: Some("init script cancelled".to_string()),
        },
        Ok(output) if output.timed_out => ScriptOutcome {
            success: false,
            error: Some(format!(
                "init script timed out after {}s",
                timeout.as_secs()
            )),
        },
        Ok(output) => {
            let stderr = output.stderr_lossy();
            let detail = stderr.trim();
            let detail = if detail.is_empty() {
                output.stdout_lossy().trim().to_string()
            } else {
                detail.to_string()
            };
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            ScriptOutcome {
                success: false,
                error: Some(if detail.is_empty() {
                    format!("init script exited with {code}")
                } else {
                    format!("init script exited with {code}: {detail}")
                }),
            }
        }
        Err(err) => ScriptOutcome {
            success: false,
            error: Some(format!("init script failed to start: {err:#}")),
        },
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
