//! Process supervisor.
//!
//! Owns one OS process per session, captures stdout/stderr into bounded
//! buffers, and exposes a non-blocking status snapshot. It never calls
//! back into the lifecycle manager; the watcher loop couples the two.
//!
//! On unix each agent runs in its own process group so termination
//! reaches the helpers an agent CLI starts.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn};

use super::provider::{ProviderRegistry, SpawnSpec};
use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// How often exit is re-checked while waiting on a termination.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// How long to wait for a forced kill to take effect.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Coarse process state reported by [`ProcessSupervisor::get_status`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Still running, or exited with output not yet drained.
    Running,
    /// Exited on its own; see [`ProcessResult::success`].
    Completed,
    /// Exited after a cancellation request.
    Cancelled,
}

/// Final result of a process, available once it has exited.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessResult {
    /// Whether the process exited with code zero and was not cancelled.
    pub success: bool,
    /// Exit code; absent when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub output: String,
    /// Captured stderr.
    pub stderr: String,
    /// Failure reason.
    pub error: Option<String>,
    /// Whether either stream exceeded the buffer limit.
    pub truncated: bool,
}

impl ProcessResult {
    /// Error describing an unsuccessful exit; `None` on success.
    #[must_use]
    pub fn exit_error(&self) -> Option<AppError> {
        (!self.success).then(|| AppError::ProcessExit {
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_owned(),
        })
    }
}

/// Non-blocking view of a supervised process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessSnapshot {
    /// Session the process belongs to.
    pub session_id: String,
    /// OS process id, if known.
    pub pid: Option<u32>,
    /// Coarse state.
    pub status: ProcessStatus,
    /// Wall-clock time since spawn.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Populated once the process has exited and output is drained.
    pub result: Option<ProcessResult>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Returned by [`ProcessSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Session the process belongs to.
    pub session_id: String,
    /// OS process id, if known.
    pub pid: Option<u32>,
}

/// What a cancellation achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process had already exited.
    AlreadyExited,
    /// The process exited after the graceful signal.
    Terminated,
    /// The process had to be killed.
    Killed,
    /// The process ignored both signals and is leaked.
    StillRunning,
}

/// Tail-keeping byte buffer with a hard size limit.
#[derive(Debug)]
struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
            self.truncated = true;
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

type SharedBuffer = Arc<Mutex<OutputBuffer>>;

#[derive(Debug, Clone, Copy)]
struct ExitRecord {
    code: Option<i32>,
    observed_at: Instant,
}

struct TrackedProcess {
    child: Mutex<Child>,
    pid: Option<u32>,
    started: Instant,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Mutex<Vec<JoinHandle<()>>>,
    cancel_requested: AtomicBool,
    exit: Mutex<Option<ExitRecord>>,
    result: Mutex<Option<ProcessResult>>,
}

impl TrackedProcess {
    /// Record an exit if the child has one. Returns whether it has exited.
    fn check_exit(&self, session_id: &str) -> bool {
        let mut exit = self.exit.lock().unwrap_or_else(PoisonError::into_inner);
        if exit.is_some() {
            return true;
        }
        let polled = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match polled {
            Ok(Some(status)) => {
                *exit = Some(ExitRecord {
                    code: status.code(),
                    observed_at: Instant::now(),
                });
                true
            }
            Ok(None) => false,
            Err(err) => {
                // Treat as exited so the dead entry is cleaned up.
                warn!(session_id, %err, "failed to poll child process status");
                *exit = Some(ExitRecord {
                    code: None,
                    observed_at: Instant::now(),
                });
                true
            }
        }
    }

    fn readers_finished(&self) -> bool {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(JoinHandle::is_finished)
    }

    fn abort_readers(&self) {
        for reader in self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            reader.abort();
        }
    }

    fn snapshot(&self, session_id: &str, drain_timeout: Duration) -> ProcessSnapshot {
        let cancelled = self.cancel_requested.load(Ordering::Acquire);
        let status_for = |result: &ProcessResult| {
            if cancelled && !result.success {
                ProcessStatus::Cancelled
            } else {
                ProcessStatus::Completed
            }
        };
        let running = || ProcessSnapshot {
            session_id: session_id.to_owned(),
            pid: self.pid,
            status: ProcessStatus::Running,
            elapsed: self.started.elapsed(),
            result: None,
        };

        if let Some(ref result) = *self.result.lock().unwrap_or_else(PoisonError::into_inner) {
            return ProcessSnapshot {
                status: status_for(result),
                result: Some(result.clone()),
                ..running()
            };
        }

        if !self.check_exit(session_id) {
            return running();
        }
        let Some(exit) = *self.exit.lock().unwrap_or_else(PoisonError::into_inner) else {
            return running();
        };

        if !self.readers_finished() {
            if exit.observed_at.elapsed() < drain_timeout {
                return running();
            }
            warn!(
                session_id,
                "output pipes still open after process exit, abandoning capture"
            );
            self.abort_readers();
        }

        let stdout = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        let stderr = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        let result = build_result(
            exit.code,
            stdout.text(),
            stderr.text(),
            cancelled,
            stdout.truncated || stderr.truncated,
        );
        drop(stdout);
        drop(stderr);

        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        info!(
            session_id,
            exit_code = ?exit.code,
            success = result.success,
            "agent process finished"
        );

        ProcessSnapshot {
            status: status_for(&result),
            result: Some(result),
            ..running()
        }
    }

    fn send_terminate(&self, session_id: &str) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(session_id, %err, "failed to send SIGTERM");
            }
            return;
        }

        self.send_kill(session_id);
    }

    fn send_kill(&self, session_id: &str) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(session_id, %err, "failed to send SIGKILL to process group");
            }
        }

        if let Err(err) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_kill()
        {
            warn!(session_id, %err, "failed to force-kill child process");
        }
    }

    async fn wait_for_exit(&self, session_id: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.check_exit(session_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

/// Translate an exit into a [`ProcessResult`].
///
/// Exit code zero is success even with empty stdout. Any other exit fails
/// with stderr as the error, or a generic message when stderr is empty.
/// A cancelled process always fails with `cancelled`.
#[must_use]
pub fn build_result(
    exit_code: Option<i32>,
    output: String,
    stderr: String,
    cancelled: bool,
    truncated: bool,
) -> ProcessResult {
    let trimmed = stderr.trim();
    let error = match exit_code {
        _ if cancelled => Some("cancelled".to_owned()),
        Some(0) => None,
        _ if !trimmed.is_empty() => Some(trimmed.to_owned()),
        Some(code) => Some(format!("exited with code {code}")),
        None => Some("terminated by signal".to_owned()),
    };

    ProcessResult {
        success: error.is_none(),
        exit_code,
        output,
        stderr,
        error,
        truncated,
    }
}

/// Process-wide table of running agent processes.
pub struct ProcessSupervisor {
    providers: ProviderRegistry,
    processes: Mutex<HashMap<String, Arc<TrackedProcess>>>,
    cancel_grace: Duration,
    drain_timeout: Duration,
    output_limit: usize,
}

impl ProcessSupervisor {
    /// Supervisor with explicit limits.
    #[must_use]
    pub fn new(
        providers: ProviderRegistry,
        cancel_grace: Duration,
        drain_timeout: Duration,
        output_limit: usize,
    ) -> Self {
        Self {
            providers,
            processes: Mutex::new(HashMap::new()),
            cancel_grace,
            drain_timeout,
            output_limit,
        }
    }

    /// Supervisor configured from `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            ProviderRegistry::from_config(config),
            config.cancel_grace(),
            config.drain_timeout(),
            config.supervisor.output_limit_bytes,
        )
    }

    /// Provider definitions used to build command lines.
    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Spawn the CLI process for `session_id` immediately.
    ///
    /// Must be called inside a Tokio runtime; output capture runs on
    /// background tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the session already has a process, the
    /// working directory is invalid, or the OS refuses to start the binary,
    /// and `AppError::ResumeUnsupported` for an illegal resume request.
    pub fn start(&self, session_id: &str, spec: &SpawnSpec) -> Result<ProcessHandle> {
        let span = info_span!("supervisor_start", session_id, provider = spec.provider);
        let _guard = span.enter();

        if self.is_tracked(session_id) {
            return Err(AppError::Spawn(format!(
                "session {session_id} already has a process"
            )));
        }

        let command_line = self.providers.build_command(spec)?;

        if !spec.working_directory.is_dir() {
            return Err(AppError::Spawn(format!(
                "working directory {} does not exist",
                spec.working_directory.display()
            )));
        }

        let mut cmd = Command::new(&command_line.program);
        cmd.args(&command_line.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CONDUCTOR_SESSION_ID", session_id)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to spawn {}: {err}", command_line.program))
        })?;
        let pid = child.id();

        let stdout = Arc::new(Mutex::new(OutputBuffer::new(self.output_limit)));
        let stderr = Arc::new(Mutex::new(OutputBuffer::new(self.output_limit)));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, Arc::clone(&stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, Arc::clone(&stderr)));
        }

        let tracked = Arc::new(TrackedProcess {
            child: Mutex::new(child),
            pid,
            started: Instant::now(),
            stdout,
            stderr,
            readers: Mutex::new(readers),
            cancel_requested: AtomicBool::new(false),
            exit: Mutex::new(None),
            result: Mutex::new(None),
        });
        self.lock_processes()
            .insert(session_id.to_owned(), tracked);

        info!(
            pid = pid.unwrap_or(0),
            program = command_line.program,
            "agent process spawned"
        );

        Ok(ProcessHandle {
            session_id: session_id.to_owned(),
            pid,
        })
    }

    /// Non-blocking snapshot of the process for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no tracked process.
    pub fn get_status(&self, session_id: &str) -> Result<ProcessSnapshot> {
        let process = self.lookup(session_id)?;
        Ok(process.snapshot(session_id, self.drain_timeout))
    }

    /// Terminate the process: graceful signal, then a forced kill after the
    /// grace period.
    ///
    /// A process that survives both is reported as
    /// [`CancelOutcome::StillRunning`] and logged as leaked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no tracked process.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome> {
        let process = self.lookup(session_id)?;
        process.cancel_requested.store(true, Ordering::Release);

        if process.check_exit(session_id) {
            return Ok(CancelOutcome::AlreadyExited);
        }

        info!(
            session_id,
            grace_ms = u64::try_from(self.cancel_grace.as_millis()).unwrap_or(u64::MAX),
            "terminating agent process"
        );
        process.send_terminate(session_id);
        if process.wait_for_exit(session_id, self.cancel_grace).await {
            info!(session_id, "agent process exited after terminate signal");
            return Ok(CancelOutcome::Terminated);
        }

        warn!(
            session_id,
            "agent process did not exit within grace period, forcing kill"
        );
        process.send_kill(session_id);
        if process.wait_for_exit(session_id, KILL_WAIT).await {
            return Ok(CancelOutcome::Killed);
        }

        error!(
            session_id,
            pid = process.pid.unwrap_or(0),
            "agent process survived kill; OS process leaked"
        );
        Ok(CancelOutcome::StillRunning)
    }

    /// Stop tracking `session_id`, returning its last snapshot.
    pub fn remove(&self, session_id: &str) -> Option<ProcessSnapshot> {
        let process = self.lock_processes().remove(session_id)?;
        Some(process.snapshot(session_id, Duration::ZERO))
    }

    /// Whether a process is tracked for `session_id`.
    #[must_use]
    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.lock_processes().contains_key(session_id)
    }

    /// Session ids with a tracked process.
    #[must_use]
    pub fn tracked_sessions(&self) -> Vec<String> {
        self.lock_processes().keys().cloned().collect()
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<TrackedProcess>> {
        self.lock_processes()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no process for session {session_id}")))
    }

    fn lock_processes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TrackedProcess>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_reader<R>(mut pipe: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(&chunk[..n]),
                Err(err) => {
                    warn!(%err, "failed to read agent output");
                    break;
                }
            }
        }
    })
}
