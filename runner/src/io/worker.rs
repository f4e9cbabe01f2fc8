//! Agent process wrapper.
//!
//! A [`Worker`] represents one attempt of one task. It exposes a live output
//! stream, an idempotent `kill`, and a `wait` that resolves exactly once with
//! an [`AgentResult`], whether the process exited, timed out, or was killed.
//!
//! The [`AgentLauncher`] trait decouples the scheduler from the agent backend.
//! [`CommandLauncher`] spawns a real process; [`SimulatedLauncher`] resolves
//! without one (dry runs). Tests use scripted launchers from `test_support`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, instrument, warn};

use crate::core::agent_stream::{LineTail, StreamAccumulator};
use crate::core::outcome::{Markers, ProcessExit, STDERR_SCAN_LINES, assess};
use crate::core::types::{AgentResult, Termination};

const STDOUT_TAIL_LINES: usize = 50;
/// Grace period for pipe readers after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const LOST_RESULT: &str = "agent worker exited without a result";

type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Parameters for one agent attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub title: String,
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
}

/// Abstraction over agent execution backends.
pub trait AgentLauncher: Send + Sync {
    /// Start one attempt. Must be called from within a tokio runtime.
    ///
    /// Launch problems the agent could have reported itself (missing binary,
    /// bad working directory) resolve as a failed worker rather than an error.
    fn spawn(&self, request: AgentRequest) -> Result<Worker>;
}

#[derive(Default)]
struct OutputFanout {
    callbacks: Vec<OutputCallback>,
    /// Lines emitted before the first listener registered.
    backlog: Vec<String>,
}

struct WorkerShared {
    task_id: String,
    pid: Option<u32>,
    output: Mutex<OutputFanout>,
    kill_requested: AtomicBool,
    kill_notify: Notify,
    result: watch::Receiver<Option<AgentResult>>,
}

/// Handle to one running (or finished) agent attempt. Clones share state.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("task_id", &self.shared.task_id)
            .field("pid", &self.shared.pid)
            .field("kill_requested", &self.kill_requested())
            .finish()
    }
}

impl Worker {
    /// A worker plus the completer its backend uses to report output and the result.
    pub fn channel(task_id: impl Into<String>, pid: Option<u32>) -> (Worker, WorkerCompleter) {
        let (tx, rx) = watch::channel(None);
        let shared = Arc::new(WorkerShared {
            task_id: task_id.into(),
            pid,
            output: Mutex::new(OutputFanout::default()),
            kill_requested: AtomicBool::new(false),
            kill_notify: Notify::new(),
            result: rx,
        });
        (
            Worker {
                shared: shared.clone(),
            },
            WorkerCompleter { shared, tx },
        )
    }

    /// A worker that has already finished with `result`.
    pub fn resolved(task_id: impl Into<String>, result: AgentResult) -> Worker {
        let (worker, completer) = Worker::channel(task_id, None);
        completer.finish(result);
        worker
    }

    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Receive every output line. The first listener also gets lines emitted so far.
    pub fn on_output<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: OutputCallback = Arc::new(callback);
        let backlog = {
            let mut output = lock(&self.shared.output);
            output.callbacks.push(callback.clone());
            std::mem::take(&mut output.backlog)
        };
        for line in &backlog {
            callback(line);
        }
    }

    /// Resolve once the attempt has finished.
    pub async fn wait(&self) -> AgentResult {
        let mut rx = self.shared.result.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => {
                let result: Option<AgentResult> = (*value).clone();
                result.unwrap_or_else(|| AgentResult::failure(LOST_RESULT))
            }
            Err(_) => AgentResult::failure(LOST_RESULT),
        }
    }

    /// Non-blocking peek at the result.
    pub fn try_result(&self) -> Option<AgentResult> {
        self.shared.result.borrow().clone()
    }

    /// Request termination. Safe to call repeatedly or after exit.
    pub fn kill(&self) {
        if !self.shared.kill_requested.swap(true, Ordering::SeqCst) {
            debug!(task_id = %self.shared.task_id, "kill requested");
            self.shared.kill_notify.notify_one();
        }
    }

    pub fn kill_requested(&self) -> bool {
        self.shared.kill_requested.load(Ordering::SeqCst)
    }
}

/// Backend side of a [`Worker`]: emits output and publishes the result.
pub struct WorkerCompleter {
    shared: Arc<WorkerShared>,
    tx: watch::Sender<Option<AgentResult>>,
}

impl WorkerCompleter {
    pub fn emit(&self, line: &str) {
        emit_line(&self.shared, line);
    }

    /// Cloneable emitter for reader tasks.
    pub fn emitter(&self) -> OutputEmitter {
        OutputEmitter {
            shared: self.shared.clone(),
        }
    }

    /// Completes once `kill` has been called on any clone of the worker.
    pub async fn killed(&self) {
        if self.shared.kill_requested.load(Ordering::SeqCst) {
            return;
        }
        self.shared.kill_notify.notified().await;
    }

    pub fn finish(self, result: AgentResult) {
        self.tx.send_replace(Some(result));
    }
}

#[derive(Clone)]
pub struct OutputEmitter {
    shared: Arc<WorkerShared>,
}

impl OutputEmitter {
    pub fn emit(&self, line: &str) {
        emit_line(&self.shared, line);
    }
}

fn emit_line(shared: &WorkerShared, line: &str) {
    let callbacks = {
        let mut output = lock(&shared.output);
        if output.callbacks.is_empty() {
            output.backlog.push(line.to_string());
            return;
        }
        output.callbacks.clone()
    };
    for callback in callbacks {
        callback(line);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Launcher that spawns `command... <prompt>` per attempt.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Vec<String>,
    markers: Markers,
}

impl CommandLauncher {
    pub fn new(command: Vec<String>, markers: Markers) -> Self {
        Self { command, markers }
    }
}

impl AgentLauncher for CommandLauncher {
    #[instrument(skip_all, fields(task_id = %request.task_id, timeout_secs = request.timeout.as_secs()))]
    fn spawn(&self, request: AgentRequest) -> Result<Worker> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = if err.kind() == std::io::ErrorKind::NotFound {
                    format!(
                        "{program}: command not found (or missing working directory {})",
                        request.workdir.display()
                    )
                } else {
                    format!("failed to spawn {program}: {err}")
                };
                warn!(err = %err, "agent spawn failed");
                return Ok(Worker::resolved(
                    request.task_id,
                    AgentResult::failure(message),
                ));
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

        let pid = child.id();
        info!(pid = ?pid, "agent spawned");
        let (worker, completer) = Worker::channel(request.task_id, pid);
        tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            completer,
            request.timeout,
            self.markers.clone(),
        ));
        Ok(worker)
    }
}

/// Drive one process to completion and publish its result.
async fn supervise<O, E>(
    mut child: Child,
    stdout: O,
    stderr: E,
    completer: WorkerCompleter,
    timeout: Duration,
    markers: Markers,
) where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let stream = Arc::new(Mutex::new(StreamAccumulator::new(STDOUT_TAIL_LINES)));
    let stderr_tail = Arc::new(Mutex::new(LineTail::new(STDERR_SCAN_LINES)));

    let stdout_reader = {
        let stream = stream.clone();
        let emitter = completer.emitter();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let forwarded = lock(&stream).push_line(&line);
                        for text in forwarded {
                            emitter.emit(&text);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(err = %err, "agent stdout read failed");
                        break;
                    }
                }
            }
        })
    };
    let stderr_reader = {
        let stderr_tail = stderr_tail.clone();
        let emitter = completer.emitter();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        emitter.emit(&format!("[stderr] {line}"));
                        lock(&stderr_tail).push(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(err = %err, "agent stderr read failed");
                        break;
                    }
                }
            }
        })
    };

    let (termination, exit_code) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => (Termination::Exited, status.code()),
            Err(err) => {
                warn!(err = %err, "wait for agent failed");
                (Termination::Exited, None)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out, killing");
            kill_child(&mut child).await;
            (Termination::TimedOut, None)
        }
        _ = completer.killed() => {
            kill_child(&mut child).await;
            (Termination::Killed, None)
        }
    };

    for reader in [stdout_reader, stderr_reader] {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            warn!("agent output still open after exit, abandoning reader");
            abort.abort();
        }
    }

    let result = {
        let stream = lock(&stream);
        let stderr_tail = lock(&stderr_tail);
        assess(
            &ProcessExit {
                termination,
                exit_code,
                timeout,
                stream: &stream,
                stderr_tail: &stderr_tail,
            },
            &markers,
        )
    };
    info!(
        success = result.success,
        termination = ?result.termination,
        exit_code = ?result.exit_code,
        "agent finished"
    );
    completer.finish(result);
}

async fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(err = %err, "kill agent failed");
    }
}

/// Launcher for dry runs: no process, one output line, then success.
#[derive(Debug, Clone)]
pub struct SimulatedLauncher {
    delay: Duration,
    markers: Markers,
}

impl SimulatedLauncher {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(400);

    pub fn new(delay: Duration, markers: Markers) -> Self {
        Self { delay, markers }
    }
}

impl AgentLauncher for SimulatedLauncher {
    fn spawn(&self, request: AgentRequest) -> Result<Worker> {
        let (worker, completer) = Worker::channel(request.task_id, None);
        let delay = self.delay;
        let completion = self.markers.completion.clone();
        let title = request.title;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    completer.emit(&format!("[simulated] {title} finished."));
                    completer.finish(AgentResult::success(Some(completion)));
                }
                _ = completer.killed() => {
                    completer.finish(AgentResult::killed());
                }
            }
        });
        Ok(worker)
    }
}
