// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process lifecycle supervision
//!
//! One record per launched command. Per process, two reader tasks stream
//! stdout and stderr line-by-line and a waiter task reaps the child; the
//! waiter publishes `process.exited` only after both readers have drained,
//! so every `log.line` for a process precedes its exit event.

use crate::log_store::LogStore;
use crate::manifest::ScriptSource;
use brum_core::{Clock, Event, EventBus, LogEntry, ProcessId, SystemClock, Topic};
use futures_util::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, info, warn};

/// Maximum logical line length read from a child stream.
const MAX_LINE_LEN: usize = 2_048;

/// Status of a supervised process. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Succeeded,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Failed | ProcessStatus::Succeeded)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProcessStatus::Running,
            2 => ProcessStatus::Stopped,
            3 => ProcessStatus::Failed,
            4 => ProcessStatus::Succeeded,
            _ => ProcessStatus::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ProcessStatus::Pending => 0,
            ProcessStatus::Running => 1,
            ProcessStatus::Stopped => 2,
            ProcessStatus::Failed => 3,
            ProcessStatus::Succeeded => 4,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Succeeded => "succeeded",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct Process {
    pub id: ProcessId,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at_ms: Option<u64>,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown script '{0}'")]
    UnknownScript(String),

    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Callback invoked for every captured log line, off the registry lock.
pub type LogCallback = Arc<dyn Fn(&LogEntry) + Send + Sync + 'static>;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay between the graceful termination signal and the forced kill.
    pub graceful_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { graceful_timeout: Duration::from_secs(5) }
    }
}

struct ProcessRecord {
    id: ProcessId,
    name: String,
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
    started_at_ms: u64,
    status: AtomicU8,
    exit_code: Mutex<Option<i32>>,
    exited_at_ms: Mutex<Option<u64>>,
    pid: Mutex<Option<u32>>,
    stop_requested: AtomicBool,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited_rx: watch::Receiver<bool>,
}

impl ProcessRecord {
    fn status(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transition to a terminal status exactly once. Later attempts and
    /// attempts from an already-terminal state are no-ops.
    fn set_terminal(&self, status: ProcessStatus) -> bool {
        loop {
            let current = self.status.load(Ordering::Acquire);
            if ProcessStatus::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .status
                .compare_exchange(current, status.as_u8(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn snapshot(&self) -> Process {
        Process {
            id: self.id.clone(),
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            work_dir: self.work_dir.clone(),
            started_at_ms: self.started_at_ms,
            exited_at_ms: *self.exited_at_ms.lock(),
            status: self.status(),
            exit_code: *self.exit_code.lock(),
        }
    }
}

struct SupervisorInner<C: Clock> {
    bus: EventBus,
    logs: LogStore,
    scripts: Arc<dyn ScriptSource>,
    clock: C,
    config: SupervisorConfig,
    // Lock order: registry before callbacks; neither held across external calls.
    registry: RwLock<HashMap<ProcessId, Arc<ProcessRecord>>>,
    callbacks: Mutex<Vec<LogCallback>>,
    counter: AtomicU64,
}

/// Launches and supervises child processes. Cheap to clone.
pub struct Supervisor<C: Clock = SystemClock> {
    inner: Arc<SupervisorInner<C>>,
}

impl<C: Clock> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Supervisor<SystemClock> {
    pub fn new(
        bus: EventBus,
        logs: LogStore,
        scripts: Arc<dyn ScriptSource>,
        config: SupervisorConfig,
    ) -> Self {
        Self::with_clock(bus, logs, scripts, config, SystemClock)
    }
}

impl<C: Clock> Supervisor<C> {
    pub fn with_clock(
        bus: EventBus,
        logs: LogStore,
        scripts: Arc<dyn ScriptSource>,
        config: SupervisorConfig,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                bus,
                logs,
                scripts,
                clock,
                config,
                registry: RwLock::new(HashMap::new()),
                callbacks: Mutex::new(Vec::new()),
                counter: AtomicU64::new(1),
            }),
        }
    }

    /// Launch a script declared in the project manifest.
    pub async fn start_script(&self, name: &str) -> Result<Process, SupervisorError> {
        let command = self
            .inner
            .scripts
            .script(name)
            .ok_or_else(|| SupervisorError::UnknownScript(name.to_string()))?;
        self.start_command(name, "sh", &["-c".to_string(), command], &[]).await
    }

    /// Launch an arbitrary command under supervision.
    pub async fn start_command(
        &self,
        name: &str,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Process, SupervisorError> {
        let seq = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let id = ProcessId::new(format!("{name}-{seq}"));
        let work_dir = self.inner.scripts.work_dir();
        let (exited_tx, exited_rx) = watch::channel(false);
        let record = Arc::new(ProcessRecord {
            id: id.clone(),
            name: name.to_string(),
            command: program.to_string(),
            args: args.to_vec(),
            work_dir: work_dir.clone(),
            started_at_ms: self.inner.clock.epoch_ms(),
            status: AtomicU8::new(ProcessStatus::Pending.as_u8()),
            exit_code: Mutex::new(None),
            exited_at_ms: Mutex::new(None),
            pid: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            kill_tx: Mutex::new(None),
            exited_rx,
        });
        self.inner.registry.write().insert(id.clone(), Arc::clone(&record));

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.fail_spawn(&record, &exited_tx, &source).await;
                return Err(SupervisorError::Spawn {
                    command: program.to_string(),
                    source,
                });
            }
        };

        *record.pid.lock() = child.id();
        record.status.store(ProcessStatus::Running.as_u8(), Ordering::Release);
        info!(process = %id, name, command = program, "process started");
        let _ = self
            .inner
            .bus
            .publish(
                Event::at(Topic::ProcessStarted, self.inner.clock.epoch_ms())
                    .for_process(id.clone())
                    .with("name", name)
                    .with("command", program),
            )
            .await;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(read_stream(
                stdout,
                false,
                Arc::clone(&self.inner),
                Arc::clone(&record),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(read_stream(
                stderr,
                true,
                Arc::clone(&self.inner),
                Arc::clone(&record),
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *record.kill_tx.lock() = Some(kill_tx);
        tokio::spawn(wait_child(
            child,
            kill_rx,
            exited_tx,
            readers,
            Arc::clone(&self.inner),
            Arc::clone(&record),
        ));

        Ok(record.snapshot())
    }

    /// Stop a process: graceful termination signal first, forced kill after
    /// the configured timeout. Returns once the child is reaped.
    pub async fn stop_process(&self, id: &str) -> Result<Process, SupervisorError> {
        let record = self
            .inner
            .registry
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        if record.status().is_terminal() {
            return Ok(record.snapshot());
        }
        record.stop_requested.store(true, Ordering::Release);

        if let Some(pid) = *record.pid.lock() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(process = %record.id, error = %e, "SIGTERM failed");
            }
        }

        let timeout = self.inner.config.graceful_timeout;
        if !wait_exited(&record, timeout).await {
            warn!(process = %record.id, "graceful stop timed out, killing");
            if let Some(tx) = record.kill_tx.lock().take() {
                let _ = tx.send(());
            }
            wait_exited(&record, timeout).await;
        }
        Ok(record.snapshot())
    }

    pub fn get_process(&self, id: &str) -> Option<Process> {
        self.inner.registry.read().get(id).map(|r| r.snapshot())
    }

    /// All known processes, newest first.
    pub fn processes(&self) -> Vec<Process> {
        let mut all: Vec<Process> =
            self.inner.registry.read().values().map(|r| r.snapshot()).collect();
        all.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms).then(b.id.cmp(&a.id)));
        all
    }

    /// Register a callback for every captured log line. Callbacks run on the
    /// reader tasks without any supervisor lock held.
    pub fn register_log_callback(&self, callback: LogCallback) {
        self.inner.callbacks.lock().push(callback);
    }

    /// Stop all non-terminal processes in parallel. Returns after the last
    /// child has been reaped (or its stop timed out twice).
    pub async fn cleanup(&self) {
        let ids: Vec<ProcessId> = {
            let registry = self.inner.registry.read();
            registry
                .values()
                .filter(|r| !r.status().is_terminal())
                .map(|r| r.id.clone())
                .collect()
        };
        let stops = ids.iter().map(|id| self.stop_process(id.as_str()));
        for result in futures_util::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "cleanup stop failed");
            }
        }
    }

    async fn fail_spawn(
        &self,
        record: &Arc<ProcessRecord>,
        exited_tx: &watch::Sender<bool>,
        error: &std::io::Error,
    ) {
        record.set_terminal(ProcessStatus::Failed);
        *record.exited_at_ms.lock() = Some(self.inner.clock.epoch_ms());
        let message = format!("failed to start: {error}");
        if let Err(e) = self
            .inner
            .logs
            .add(record.id.clone(), record.name.clone(), message, true)
            .await
        {
            warn!(process = %record.id, error = %e, "could not record spawn failure");
        }
        let _ = self
            .inner
            .bus
            .publish(
                Event::at(Topic::ProcessExited, self.inner.clock.epoch_ms())
                    .for_process(record.id.clone())
                    .with("status", "failed")
                    .with("error", error.to_string()),
            )
            .await;
        let _ = exited_tx.send(true);
    }
}

async fn wait_exited(record: &Arc<ProcessRecord>, timeout: Duration) -> bool {
    let mut rx = record.exited_rx.clone();
    let result = tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await;
    result.is_ok()
}

/// Stream one pipe line-by-line into the log store, the callbacks, and the
/// bus. Lines beyond the length cap are dropped with a warning; the codec
/// resynchronizes at the next newline.
async fn read_stream<C: Clock, R: AsyncRead + Unpin>(
    stream: R,
    is_error: bool,
    inner: Arc<SupervisorInner<C>>,
    record: Arc<ProcessRecord>,
) {
    let codec = AnyDelimiterCodec::new_with_max_length(vec![b'\n'], Vec::new(), MAX_LINE_LEN);
    let mut frames = FramedRead::new(stream, codec);
    while let Some(item) = frames.next().await {
        let raw = match item {
            Ok(bytes) => bytes,
            Err(tokio_util::codec::AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                debug!(process = %record.id, "log line exceeded max length, dropped");
                continue;
            }
            Err(_) => break,
        };
        let line = sanitize_line(&String::from_utf8_lossy(&raw));
        if line.is_empty() {
            continue;
        }

        let entry = match inner
            .logs
            .add(record.id.clone(), record.name.clone(), line.clone(), is_error)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                // Overloaded store: drop the line rather than block the pipe.
                debug!(process = %record.id, error = %e, "log line dropped");
                continue;
            }
        };

        let callbacks: Vec<LogCallback> = inner.callbacks.lock().clone();
        for callback in callbacks {
            callback(&entry);
        }

        let _ = inner
            .bus
            .publish(
                Event::at(Topic::LogLine, entry.timestamp_ms)
                    .for_process(record.id.clone())
                    .with("line", line.clone())
                    .with("isError", entry.is_error)
                    .with("processName", record.name.clone()),
            )
            .await;
        if entry.is_error {
            let _ = inner
                .bus
                .publish(
                    Event::at(Topic::ErrorDetected, entry.timestamp_ms)
                        .for_process(record.id.clone())
                        .with("line", line),
                )
                .await;
        }
    }
}

/// Reap the child and publish `process.exited` after both readers drained.
async fn wait_child<C: Clock>(
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    inner: Arc<SupervisorInner<C>>,
    record: Arc<ProcessRecord>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // Readers hit EOF once the child exits; waiting on them here is what
    // guarantees every log.line precedes process.exited.
    for reader in readers {
        let _ = reader.await;
    }

    let exit_code = match &status {
        Ok(status) => Some(exit_code_of(status)),
        Err(_) => None,
    };
    *record.exit_code.lock() = exit_code;
    *record.exited_at_ms.lock() = Some(inner.clock.epoch_ms());

    let terminal = if record.stop_requested.load(Ordering::Acquire) {
        ProcessStatus::Stopped
    } else if matches!(exit_code, Some(0)) {
        ProcessStatus::Succeeded
    } else {
        ProcessStatus::Failed
    };
    record.set_terminal(terminal);
    info!(process = %record.id, status = %terminal, exit_code = ?exit_code, "process exited");

    let mut event = Event::at(Topic::ProcessExited, inner.clock.epoch_ms())
        .for_process(record.id.clone())
        .with("status", terminal.to_string());
    if let Some(code) = exit_code {
        event = event.with("exitCode", code);
    }
    let _ = inner.bus.publish(event).await;
    let _ = exited_tx.send(true);
}

/// Exit code, folding a killing signal into the conventional `128 + signo`.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        code
    } else {
        128 + status.signal().unwrap_or(0)
    }
}

/// Strip control characters (keeping tabs) so binary garbage in a stream
/// cannot corrupt the terminal or the stored logs.
fn sanitize_line(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
