//! Process supervisor for long-running shell commands.
//!
//! `start` spawns and returns immediately. Two reader tasks keep bounded
//! output tails, and one waiter task owns the child: it observes exit,
//! enforces the timeout and carries out kill requests. Callers only ever see
//! snapshots through `poll`.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ProcessConfig;

/// Finished entries kept regardless of the retention window.
const MAX_FINISHED_ENTRIES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown process: {0}")]
    NotFound(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("process registry io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited,
    Killed,
}

impl ProcessStatus {
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
        })
    }
}

/// Identity of a supervised process, returned by [`ProcessSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub process_id: String,
    pub run_id: String,
    pub step_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Snapshot returned by [`ProcessSupervisor::poll`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPoll {
    pub process_id: String,
    pub status: ProcessStatus,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// No output for longer than the quiet window while still running.
    pub stalled: bool,
    pub timed_out: bool,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub last_output_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl fmt::Display for ProcessPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.process_id, self.status)?;
        if let Some(code) = self.exit_code {
            write!(f, " exit={code}")?;
        }
        if self.stalled {
            f.write_str(" (stalled)")?;
        }
        if self.timed_out {
            f.write_str(" (timed out)")?;
        }
        write!(
            f,
            " stdout={}B stderr={}B {}ms",
            self.stdout_bytes, self.stderr_bytes, self.elapsed_ms
        )
    }
}

/// Runtime knobs, usually derived from [`ProcessConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub default_timeout: Duration,
    pub quiet_window: Duration,
    pub grace_period: Duration,
    pub tail_bytes: usize,
    /// How long a finished process stays pollable.
    pub retention: Duration,
    /// `processes.json`; `None` disables orphan tracking.
    pub registry_path: Option<PathBuf>,
}

impl SupervisorSettings {
    #[must_use]
    pub fn from_config(config: &ProcessConfig, registry_path: Option<PathBuf>) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            quiet_window: Duration::from_secs(config.quiet_window_secs),
            grace_period: Duration::from_secs(config.grace_period_secs),
            tail_bytes: config.tail_bytes,
            retention: Duration::from_secs(config.retention_secs),
            registry_path,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ProcessConfig::default(), None)
    }
}

/// Last `limit` bytes of a stream plus the running total.
#[derive(Debug)]
struct Tail {
    buf: Vec<u8>,
    limit: usize,
    total: u64,
}

impl Tail {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[derive(Debug)]
struct ProcState {
    status: ProcessStatus,
    exit_code: Option<i32>,
    stdout: Tail,
    stderr: Tail,
    started: Instant,
    last_output: Instant,
    last_output_at: Option<DateTime<Utc>>,
    timed_out: bool,
    finished: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct KillRequest {
    force: bool,
}

#[derive(Debug)]
struct Entry {
    handle: ProcessHandle,
    state: Arc<Mutex<ProcState>>,
    kill_tx: mpsc::Sender<KillRequest>,
    done_rx: watch::Receiver<bool>,
}

/// Orphan-tracking record persisted in `processes.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub process_id: String,
    pub pid: u32,
    pub run_id: String,
    pub step_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    /// Kernel start time of `pid`, used to tell a live orphan from a reused pid.
    #[serde(default)]
    pub start_ticks: Option<u64>,
}

#[derive(Debug)]
struct PidRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PidRegistry {
    fn read(&self) -> Vec<PidRecord> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write(&self, records: &[PidRecord]) -> Result<(), ProcessError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(records).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Vec<PidRecord>)) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut records = self.read();
        f(&mut records);
        if let Err(e) = self.write(&records) {
            tracing::warn!(path = %self.path.display(), "failed to update process registry: {e}");
        }
    }
}

#[derive(Debug)]
struct Inner {
    settings: SupervisorSettings,
    entries: Mutex<HashMap<String, Entry>>,
    registry: Option<PidRegistry>,
}

/// Sole owner of every child process started by tools.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        let registry = settings.registry_path.clone().map(|path| PidRegistry {
            path,
            lock: Mutex::new(()),
        });
        Self {
            inner: Arc::new(Inner {
                settings,
                entries: Mutex::new(HashMap::new()),
                registry,
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Terminate processes recorded by a previous instance that are still alive.
    ///
    /// A pid is signalled only when its kernel start time still matches the
    /// recorded one; anything else is treated as a reused pid and left alone.
    /// Best effort: every record is logged, the registry is cleared afterwards.
    pub fn reap_orphans(&self) -> Vec<PidRecord> {
        let Some(registry) = &self.inner.registry else {
            return Vec::new();
        };
        let records = registry.read();
        let mut reaped = Vec::new();
        for record in records {
            if !is_pid_alive(record.pid) {
                tracing::info!(
                    process_id = %record.process_id,
                    pid = record.pid,
                    "orphan record for exited process dropped"
                );
            } else if record.start_ticks.is_none()
                || process_start_ticks(record.pid) != record.start_ticks
            {
                tracing::warn!(
                    process_id = %record.process_id,
                    pid = record.pid,
                    command = %record.command,
                    "pid is alive but cannot be matched to the recorded process, not signalled"
                );
            } else {
                signal_group(record.pid, Signal::Term);
                tracing::warn!(
                    process_id = %record.process_id,
                    pid = record.pid,
                    run_id = %record.run_id,
                    step_id = %record.step_id,
                    command = %record.command,
                    "reaped orphaned process from previous session"
                );
                reaped.push(record);
            }
        }
        registry.update(Vec::clear);
        reaped
    }

    /// Spawn `command` through `bash -c` and return immediately.
    ///
    /// # Errors
    ///
    /// `InvalidCommand` for an empty command, `Spawn` when the shell cannot
    /// be started.
    pub fn start(
        &self,
        command: &str,
        cwd: &std::path::Path,
        timeout: Option<Duration>,
        run_id: &str,
        step_id: &str,
    ) -> Result<ProcessHandle, ProcessError> {
        if command.trim().is_empty() {
            return Err(ProcessError::InvalidCommand("empty command".into()));
        }
        self.prune_finished();
        let settings = &self.inner.settings;
        let timeout = timeout.unwrap_or(settings.default_timeout);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        own_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.to_owned(),
            source,
        })?;

        let now = Instant::now();
        let state = Arc::new(Mutex::new(ProcState {
            status: ProcessStatus::Starting,
            exit_code: None,
            stdout: Tail::new(settings.tail_bytes),
            stderr: Tail::new(settings.tail_bytes),
            started: now,
            last_output: now,
            last_output_at: None,
            timed_out: false,
            finished: None,
        }));

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(&state), Stream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(&state), Stream::Stderr));
        }

        let handle = ProcessHandle {
            process_id: new_process_id(),
            run_id: run_id.to_owned(),
            step_id: step_id.to_owned(),
            command: command.to_owned(),
            pid: child.id(),
            started_at: Utc::now(),
        };

        if let (Some(registry), Some(pid)) = (&self.inner.registry, handle.pid) {
            let record = PidRecord {
                process_id: handle.process_id.clone(),
                pid,
                run_id: handle.run_id.clone(),
                step_id: handle.step_id.clone(),
                command: handle.command.clone(),
                started_at: handle.started_at,
                start_ticks: process_start_ticks(pid),
            };
            registry.update(|records| records.push(record));
        }

        let (kill_tx, kill_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(supervise(
            child,
            Arc::clone(&self.inner),
            handle.process_id.clone(),
            Arc::clone(&state),
            Waiter {
                timeout,
                grace: settings.grace_period,
                kill_rx,
                done_tx,
                readers,
            },
        ));

        tracing::info!(
            process_id = %handle.process_id,
            pid = ?handle.pid,
            run_id = %run_id,
            step_id = %step_id,
            timeout_secs = timeout.as_secs(),
            "process started"
        );

        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.insert(
                handle.process_id.clone(),
                Entry {
                    handle: handle.clone(),
                    state,
                    kill_tx,
                    done_rx,
                },
            );
        }
        Ok(handle)
    }

    /// Non-blocking status snapshot.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id was never started by this supervisor.
    pub fn poll(&self, process_id: &str) -> Result<ProcessPoll, ProcessError> {
        let entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| ProcessError::NotFound(process_id.to_owned()))?;
        let entry = entries
            .get(process_id)
            .ok_or_else(|| ProcessError::NotFound(process_id.to_owned()))?;
        Ok(snapshot(
            process_id,
            &entry.state,
            self.inner.settings.quiet_window,
        ))
    }

    /// Wait until the process has exited or been killed.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn wait(&self, process_id: &str) -> Result<ProcessPoll, ProcessError> {
        let mut done_rx = self.done_receiver(process_id)?;
        let _ = done_rx.wait_for(|done| *done).await;
        self.poll(process_id)
    }

    /// Terminate a process: SIGTERM, then force kill after the grace period.
    ///
    /// Returns once the process is gone. Killing a process that already
    /// exited is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn kill(&self, process_id: &str, force: bool) -> Result<ProcessPoll, ProcessError> {
        let (kill_tx, mut done_rx) = {
            let entries = self
                .inner
                .entries
                .lock()
                .map_err(|_| ProcessError::NotFound(process_id.to_owned()))?;
            let entry = entries
                .get(process_id)
                .ok_or_else(|| ProcessError::NotFound(process_id.to_owned()))?;
            (entry.kill_tx.clone(), entry.done_rx.clone())
        };
        if !*done_rx.borrow() {
            tracing::info!(process_id, force, "killing process");
            // Fails only when the waiter already finished or a kill is queued.
            let _ = kill_tx.try_send(KillRequest { force });
            let _ = done_rx.wait_for(|done| *done).await;
        }
        self.poll(process_id)
    }

    /// Kill every process started for `run_id`.
    pub async fn kill_run(&self, run_id: &str) {
        let ids: Vec<String> = self
            .inner
            .entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.handle.run_id == run_id)
                    .map(|e| e.handle.process_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for id in ids {
            let _ = self.kill(&id, false).await;
        }
    }

    #[must_use]
    pub fn handle(&self, process_id: &str) -> Option<ProcessHandle> {
        self.inner
            .entries
            .lock()
            .ok()?
            .get(process_id)
            .map(|e| e.handle.clone())
    }

    /// Handles of all tracked processes, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self
            .inner
            .entries
            .lock()
            .map(|entries| entries.values().map(|e| e.handle.clone()).collect())
            .unwrap_or_default();
        handles.sort_by_key(|h| h.started_at);
        handles
    }

    /// Forget finished processes past the retention window, and the oldest
    /// ones beyond [`MAX_FINISHED_ENTRIES`]. Returns how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let Ok(mut entries) = self.inner.entries.lock() else {
            return 0;
        };
        let mut finished: Vec<(Instant, String)> = entries
            .iter()
            .filter_map(|(id, e)| {
                e.state
                    .lock()
                    .ok()
                    .and_then(|st| st.finished)
                    .map(|at| (at, id.clone()))
            })
            .collect();
        finished.sort();
        let retention = self.inner.settings.retention;
        let over_cap = finished.len().saturating_sub(MAX_FINISHED_ENTRIES);
        let mut dropped = 0;
        for (i, (at, id)) in finished.into_iter().enumerate() {
            if i < over_cap || at.elapsed() >= retention {
                entries.remove(&id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "finished processes forgotten");
        }
        dropped
    }

    fn done_receiver(&self, process_id: &str) -> Result<watch::Receiver<bool>, ProcessError> {
        let entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| ProcessError::NotFound(process_id.to_owned()))?;
        entries
            .get(process_id)
            .map(|e| e.done_rx.clone())
            .ok_or_else(|| ProcessError::NotFound(process_id.to_owned()))
    }
}

fn new_process_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("proc-{}", &id[..8])
}

fn snapshot(process_id: &str, state: &Mutex<ProcState>, quiet_window: Duration) -> ProcessPoll {
    let Ok(st) = state.lock() else {
        return ProcessPoll {
            process_id: process_id.to_owned(),
            status: ProcessStatus::Killed,
            running: false,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            stalled: false,
            timed_out: false,
            stdout_bytes: 0,
            stderr_bytes: 0,
            last_output_at: None,
            elapsed_ms: 0,
        };
    };
    let running = st.status.is_running();
    ProcessPoll {
        process_id: process_id.to_owned(),
        status: st.status,
        running,
        exit_code: st.exit_code,
        stdout_tail: st.stdout.text(),
        stderr_tail: st.stderr.text(),
        stalled: running && st.last_output.elapsed() > quiet_window,
        timed_out: st.timed_out,
        stdout_bytes: st.stdout.total,
        stderr_bytes: st.stderr.total,
        last_output_at: st.last_output_at,
        elapsed_ms: u64::try_from(st.started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

fn spawn_reader<R>(mut reader: R, state: Arc<Mutex<ProcState>>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut st) = state.lock() {
                        match stream {
                            Stream::Stdout => st.stdout.push(&buf[..n]),
                            Stream::Stderr => st.stderr.push(&buf[..n]),
                        }
                        st.last_output = Instant::now();
                        st.last_output_at = Some(Utc::now());
                    }
                }
            }
        }
    })
}

struct Waiter {
    timeout: Duration,
    grace: Duration,
    kill_rx: mpsc::Receiver<KillRequest>,
    done_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
}

enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Kill(KillRequest),
}

async fn supervise(
    mut child: Child,
    inner: Arc<Inner>,
    process_id: String,
    state: Arc<Mutex<ProcState>>,
    mut waiter: Waiter,
) {
    if let Ok(mut st) = state.lock() {
        st.status = ProcessStatus::Running;
    }
    let pid = child.id();

    let trigger = tokio::select! {
        status = child.wait() => Trigger::Exited(status),
        () = tokio::time::sleep(waiter.timeout) => Trigger::TimedOut,
        Some(req) = waiter.kill_rx.recv() => Trigger::Kill(req),
    };

    let (status, final_status, timed_out) = match trigger {
        Trigger::Exited(status) => (status, ProcessStatus::Exited, false),
        Trigger::TimedOut => {
            tracing::warn!(
                process_id = %process_id,
                timeout_secs = waiter.timeout.as_secs(),
                "process timed out"
            );
            (
                terminate(&mut child, pid, waiter.grace, false).await,
                ProcessStatus::Killed,
                true,
            )
        }
        Trigger::Kill(req) => (
            terminate(&mut child, pid, waiter.grace, req.force).await,
            ProcessStatus::Killed,
            false,
        ),
    };

    for reader in waiter.readers.drain(..) {
        let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
    }

    let exit_code = match &status {
        Ok(s) => s.code(),
        Err(e) => {
            tracing::warn!(process_id = %process_id, "failed to observe process exit: {e}");
            None
        }
    };
    if let Ok(mut st) = state.lock() {
        st.status = final_status;
        st.exit_code = exit_code;
        st.timed_out = timed_out;
        st.finished = Some(Instant::now());
    }
    if let Some(registry) = &inner.registry {
        registry.update(|records| records.retain(|r| r.process_id != process_id));
    }
    tracing::info!(
        process_id = %process_id,
        status = %final_status,
        exit_code = ?exit_code,
        "process finished"
    );
    let _ = waiter.done_tx.send(true);
}

async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
    force: bool,
) -> std::io::Result<ExitStatus> {
    if !force && let Some(pid) = pid {
        signal_group(pid, Signal::Term);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }
    if let Some(pid) = pid {
        signal_group(pid, Signal::Kill);
    }
    child.kill().await?;
    child.wait().await
}

/// Lead a new process group so signals reach the whole pipeline.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid addresses a process group; no memory is touched.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        // Not a group leader (e.g. an orphan recorded by an older build).
        #[allow(unsafe_code)]
        let _ = unsafe { libc::kill(pid, sig) };
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    false
}

/// Start time of `pid` in clock ticks since boot (`/proc/<pid>/stat` field 22).
#[cfg(target_os = "linux")]
fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may hold spaces or parentheses; fields resume after the last ')'.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_start_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::CommandExt;

    use super::*;

    fn supervisor(quiet: Duration) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorSettings {
            default_timeout: Duration::from_secs(30),
            quiet_window: quiet,
            grace_period: Duration::from_secs(2),
            tail_bytes: 64,
            retention: Duration::from_secs(600),
            registry_path: None,
        })
    }

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn start_returns_before_exit() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup.start("sleep 5", &cwd(), None, "r", "s").unwrap();
        let poll = sup.poll(&handle.process_id).unwrap();
        assert!(poll.running);
        assert_eq!(poll.exit_code, None);
        sup.kill(&handle.process_id, true).await.unwrap();
    }

    #[tokio::test]
    async fn exit_code_observed() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup.start("echo hi; exit 3", &cwd(), None, "r", "s").unwrap();
        let poll = sup.wait(&handle.process_id).await.unwrap();
        assert!(!poll.running);
        assert_eq!(poll.status, ProcessStatus::Exited);
        assert_eq!(poll.exit_code, Some(3));
        assert_eq!(poll.stdout_tail, "hi\n");
        assert!(poll.last_output_at.is_some());
    }

    #[tokio::test]
    async fn tails_are_bounded() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup
            .start("head -c 1000 /dev/zero | tr '\\0' 'a'; echo err >&2", &cwd(), None, "r", "s")
            .unwrap();
        let poll = sup.wait(&handle.process_id).await.unwrap();
        assert_eq!(poll.stdout_tail.len(), 64);
        assert_eq!(poll.stdout_bytes, 1000);
        assert_eq!(poll.stderr_tail, "err\n");
    }

    #[tokio::test]
    async fn quiet_process_reported_stalled() {
        let sup = supervisor(Duration::from_millis(50));
        let handle = sup.start("sleep 5", &cwd(), None, "r", "s").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let poll = sup.poll(&handle.process_id).unwrap();
        assert!(poll.running);
        assert!(poll.stalled);
        sup.kill(&handle.process_id, true).await.unwrap();
    }

    #[tokio::test]
    async fn graceful_kill_terminates() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup.start("sleep 30", &cwd(), None, "r", "s").unwrap();
        let poll = sup.kill(&handle.process_id, false).await.unwrap();
        assert!(!poll.running);
        assert_eq!(poll.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn kill_twice_is_noop() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup.start("sleep 30", &cwd(), None, "r", "s").unwrap();
        let first = sup.kill(&handle.process_id, true).await.unwrap();
        let second = sup.kill(&handle.process_id, true).await.unwrap();
        assert_eq!(first.status, ProcessStatus::Killed);
        assert_eq!(second.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn kill_exited_process_is_noop() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup.start("true", &cwd(), None, "r", "s").unwrap();
        sup.wait(&handle.process_id).await.unwrap();
        let poll = sup.kill(&handle.process_id, false).await.unwrap();
        assert_eq!(poll.status, ProcessStatus::Exited);
        assert_eq!(poll.exit_code, Some(0));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let sup = supervisor(Duration::from_secs(30));
        let handle = sup
            .start("sleep 30", &cwd(), Some(Duration::from_millis(100)), "r", "s")
            .unwrap();
        let poll = sup.wait(&handle.process_id).await.unwrap();
        assert!(poll.timed_out);
        assert_eq!(poll.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn unknown_process_not_found() {
        let sup = supervisor(Duration::from_secs(30));
        assert!(matches!(sup.poll("proc-x"), Err(ProcessError::NotFound(_))));
        assert!(matches!(
            sup.kill("proc-x", true).await,
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let sup = supervisor(Duration::from_secs(30));
        assert!(matches!(
            sup.start("  ", &cwd(), None, "r", "s"),
            Err(ProcessError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn registry_tracks_and_clears_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");
        let sup = ProcessSupervisor::new(SupervisorSettings {
            registry_path: Some(path.clone()),
            ..SupervisorSettings::default()
        });
        let handle = sup.start("sleep 30", dir.path(), None, "r", "s").unwrap();
        let records: Vec<PidRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].process_id, handle.process_id);

        sup.kill(&handle.process_id, true).await.unwrap();
        let records: Vec<PidRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(records.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reap_orphans_terminates_live_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");
        let mut orphan = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let records = vec![
            PidRecord {
                process_id: "proc-old".into(),
                pid: orphan.id(),
                run_id: "r".into(),
                step_id: "s".into(),
                command: "sleep 30".into(),
                started_at: Utc::now(),
                start_ticks: process_start_ticks(orphan.id()),
            },
            PidRecord {
                process_id: "proc-gone".into(),
                pid: 999_999_999,
                run_id: "r".into(),
                step_id: "s".into(),
                command: "true".into(),
                started_at: Utc::now(),
                start_ticks: None,
            },
        ];
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let sup = ProcessSupervisor::new(SupervisorSettings {
            registry_path: Some(path.clone()),
            ..SupervisorSettings::default()
        });
        let reaped = sup.reap_orphans();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].process_id, "proc-old");
        let status = orphan.wait().unwrap();
        assert!(!status.success());
        let left: Vec<PidRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(left.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reused_pid_is_not_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");
        let mut bystander = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let ticks = process_start_ticks(bystander.id()).unwrap();
        let records = vec![PidRecord {
            process_id: "proc-stale".into(),
            pid: bystander.id(),
            run_id: "r".into(),
            step_id: "s".into(),
            command: "sleep 30".into(),
            started_at: Utc::now(),
            start_ticks: Some(ticks + 1),
        }];
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let sup = ProcessSupervisor::new(SupervisorSettings {
            registry_path: Some(path.clone()),
            ..SupervisorSettings::default()
        });
        assert!(sup.reap_orphans().is_empty());
        assert!(bystander.try_wait().unwrap().is_none());
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn start_ticks_read_for_own_process() {
        assert!(process_start_ticks(std::process::id()).is_some());
        assert!(process_start_ticks(999_999_999).is_none());
    }

    #[tokio::test]
    async fn finished_processes_are_pruned_after_retention() {
        let sup = ProcessSupervisor::new(SupervisorSettings {
            retention: Duration::ZERO,
            ..SupervisorSettings::default()
        });
        let done = sup.start("true", &cwd(), None, "r", "s1").unwrap();
        sup.wait(&done.process_id).await.unwrap();
        let live = sup.start("sleep 30", &cwd(), None, "r", "s2").unwrap();

        assert!(matches!(
            sup.poll(&done.process_id),
            Err(ProcessError::NotFound(_))
        ));
        assert_eq!(sup.list().len(), 1);
        assert!(sup.poll(&live.process_id).unwrap().running);
        sup.kill(&live.process_id, true).await.unwrap();
        assert_eq!(sup.prune_finished(), 1);
        assert!(sup.list().is_empty());
    }

    #[tokio::test]
    async fn finished_processes_stay_pollable_within_retention() {
        let sup = supervisor(Duration::from_secs(30));
        let first = sup.start("true", &cwd(), None, "r", "s1").unwrap();
        sup.wait(&first.process_id).await.unwrap();
        let second = sup.start("true", &cwd(), None, "r", "s2").unwrap();
        sup.wait(&second.process_id).await.unwrap();
        assert_eq!(sup.prune_finished(), 0);
        assert_eq!(sup.poll(&first.process_id).unwrap().exit_code, Some(0));
    }
}
