//! Child-process supervision: spawning with log redirection, liveness
//! tracking, process-group signalling, and exit reaping.

use foreman_store::JobStore;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const REAP_INTERVAL_MS: u64 = 1_000;
const STOP_POLL_MS: u64 = 100;
// An interactive shell sometimes ignores the first SIGTERM, so the polite
// signal is repeated before escalating to SIGKILL.
const STOP_TERM_ATTEMPTS: u32 = 3;
const STOP_TERM_GRACE_MS: u64 = 1_500;

/// Errors surfaced when a child process cannot be launched.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("permission denied running '{0}'")]
    PermissionDenied(String),
    #[error("working directory invalid: {0}")]
    WorkingDirInvalid(PathBuf),
    #[error("log file unwritable: {path}: {source}")]
    LogUnwritable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to fork child process: {0}")]
    ForkFailed(std::io::Error),
}

/// Everything the supervisor needs to launch one job's child process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub job_id: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub logdir: PathBuf,
    /// Stem for the `<stem>.stdout` / `<stem>.stderr` log pair.
    pub logfile: String,
    pub env: BTreeMap<String, String>,
}

/// Successful spawn result.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedJob {
    pub pid: u32,
}

/// Where a located process handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOrigin {
    /// Live handle registered by a spawn in this process.
    Registry,
    /// Reconstructed from the persisted record of another supervisor after
    /// the pid and command line checked out.
    Adopted,
}

/// Read-only view of a located live process.
#[derive(Debug, Clone, Copy)]
pub struct FoundProcess {
    pub pid: u32,
    pub origin: ProcessOrigin,
}

/// How a reaped child left the process table.
#[derive(Debug, Clone, Copy)]
pub enum ReapOutcome {
    /// Exit status collected by a non-blocking wait.
    Exited(ExitStatus),
    /// The pid disappeared without a collectible status.
    Vanished,
}

/// Terminal observation published by the reaper for one spawn.
#[derive(Debug, Clone)]
pub struct ReapEvent {
    pub job_id: String,
    /// Pid of the spawn the observation belongs to; consumers use it to
    /// discard events that raced a relaunch.
    pub pid: u32,
    pub outcome: ReapOutcome,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A termination signal was issued (or the process was already gone).
    Stopped,
    /// No live process could be located for the id.
    NotFound,
}

#[derive(Debug)]
struct RegisteredChild {
    pid: u32,
    child: Child,
}

struct SupervisorInner {
    store: Arc<dyn JobStore>,
    registry: Mutex<HashMap<String, RegisteredChild>>,
    /// Last published observation per job id, so a status read racing the
    /// event channel can still learn how the most recent spawn exited.
    recent_exits: Mutex<HashMap<String, ReapEvent>>,
    events: mpsc::UnboundedSender<ReapEvent>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

/// Launches child processes, tracks their live handles, and publishes exit
/// observations from a background reaper task.
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor and starts its reaper task. `events` receives
    /// one `ReapEvent` per observed child exit.
    pub fn new(store: Arc<dyn JobStore>, events: mpsc::UnboundedSender<ReapEvent>) -> Self {
        Self::with_reap_interval(store, events, Duration::from_millis(REAP_INTERVAL_MS))
    }

    pub(crate) fn with_reap_interval(
        store: Arc<dyn JobStore>,
        events: mpsc::UnboundedSender<ReapEvent>,
        reap_interval: Duration,
    ) -> Self {
        let inner = Arc::new(SupervisorInner {
            store,
            registry: Mutex::new(HashMap::new()),
            recent_exits: Mutex::new(HashMap::new()),
            events,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        });
        let reaper_inner = Arc::clone(&inner);
        let reaper = tokio::spawn(async move {
            Self::reaper_loop(reaper_inner, reap_interval).await;
        });
        Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Launches `request.command` under the platform shell with stdout and
    /// stderr redirected to the truncated log pair, in its own process
    /// group, and registers the handle under `request.job_id` (replacing any
    /// prior handle for the same id).
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedJob, SpawnError> {
        if let Some(cwd) = request.cwd.as_ref() {
            if !cwd.is_dir() {
                return Err(SpawnError::WorkingDirInvalid(cwd.clone()));
            }
        }

        std::fs::create_dir_all(&request.logdir).map_err(|source| SpawnError::LogUnwritable {
            path: request.logdir.clone(),
            source,
        })?;
        let stdout_path = request.logdir.join(format!("{}.stdout", request.logfile));
        let stderr_path = request.logdir.join(format!("{}.stderr", request.logfile));
        let stdout_file = open_truncated(&stdout_path)?;
        let stderr_file = open_truncated(&stderr_path)?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(&request.command);
        if let Some(cwd) = request.cwd.as_ref() {
            command.current_dir(cwd);
        }
        command.env("JOB_ID", &request.job_id);
        for (key, value) in &request.env {
            command.env(key, value);
        }
        // The child owns the log descriptors from here on; the parent's
        // copies are consumed by the Stdio handoff.
        command.stdout(Stdio::from(stdout_file));
        command.stderr(Stdio::from(stderr_file));
        // New process group so termination signals reach the whole
        // subprocess tree.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(classify_spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            SpawnError::ForkFailed(std::io::Error::other(
                "child exited before its pid could be read",
            ))
        })?;

        let mut registry = lock_unpoisoned(&self.inner.registry);
        registry.insert(request.job_id.clone(), RegisteredChild { pid, child });
        debug!(job_id = %request.job_id, pid, "spawned child process");
        Ok(SpawnedJob { pid })
    }

    /// Locates a live process for `job_id`.
    ///
    /// The in-memory registry wins; otherwise the persisted record's
    /// `last_pid` is adopted, but only when the pid is alive AND its command
    /// line still matches the stored command, which guards against pid
    /// reuse.
    pub async fn find(&self, job_id: &str) -> Option<FoundProcess> {
        {
            let registry = lock_unpoisoned(&self.inner.registry);
            if let Some(entry) = registry.get(job_id) {
                if pid_alive(entry.pid) {
                    return Some(FoundProcess {
                        pid: entry.pid,
                        origin: ProcessOrigin::Registry,
                    });
                }
            }
        }

        let record = self.inner.store.get(job_id).await.ok().flatten()?;
        if record.last_pid == 0 || !pid_alive(record.last_pid) {
            return None;
        }
        if !cmdline_matches(record.last_pid, &record.command) {
            debug!(
                job_id,
                pid = record.last_pid,
                "persisted pid alive but command line does not match; treating as pid reuse"
            );
            return None;
        }
        Some(FoundProcess {
            pid: record.last_pid,
            origin: ProcessOrigin::Adopted,
        })
    }

    /// Pid of the registered handle for `job_id`, if any.
    pub fn registered(&self, job_id: &str) -> Option<u32> {
        let registry = lock_unpoisoned(&self.inner.registry);
        registry.get(job_id).map(|entry| entry.pid)
    }

    /// The most recent exit observation published for `job_id`, if any.
    /// Lets a caller that raced the event channel resolve how a spawn
    /// ended.
    pub fn last_reap(&self, job_id: &str) -> Option<ReapEvent> {
        let recent_exits = lock_unpoisoned(&self.inner.recent_exits);
        recent_exits.get(job_id).cloned()
    }

    /// Sends SIGTERM to the job's process group, retrying the polite signal
    /// before escalating to SIGKILL, and returns once a signal has been
    /// issued. Exit observation stays with the reaper.
    pub async fn stop(&self, job_id: &str) -> StopOutcome {
        let Some(found) = self.find(job_id).await else {
            return StopOutcome::NotFound;
        };
        let group = Pid::from_raw(found.pid as i32);

        for attempt in 1..=STOP_TERM_ATTEMPTS {
            if killpg(group, Signal::SIGTERM).is_err() {
                // ESRCH: the group vanished between find and signal.
                return StopOutcome::Stopped;
            }
            debug!(job_id, pid = found.pid, attempt, "sent SIGTERM to process group");

            let deadline = Instant::now() + Duration::from_millis(STOP_TERM_GRACE_MS);
            while Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(STOP_POLL_MS)).await;
                if !self.still_running(job_id, found) {
                    return StopOutcome::Stopped;
                }
            }
        }

        if self.still_running(job_id, found) {
            warn!(
                job_id,
                pid = found.pid,
                "process survived {STOP_TERM_ATTEMPTS} SIGTERM attempts, escalating to SIGKILL"
            );
            let _ = killpg(group, Signal::SIGKILL);
        }
        StopOutcome::Stopped
    }

    /// All registry entries whose processes the OS still reports alive,
    /// ordered by job id.
    pub fn list(&self) -> Vec<(String, u32)> {
        let registry = lock_unpoisoned(&self.inner.registry);
        let mut entries: Vec<(String, u32)> = registry
            .iter()
            .filter(|(_, entry)| pid_alive(entry.pid))
            .map(|(job_id, entry)| (job_id.clone(), entry.pid))
            .collect();
        entries.sort();
        entries
    }

    /// Signals the reaper task and waits for it to finish. In-flight
    /// children are NOT killed; the store keeps their pids, so another
    /// supervisor can adopt them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        let handle = lock_unpoisoned(&self.reaper).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Liveness check used by stop's grace polling. For registry-owned
    /// children this also reaps an already-exited child immediately instead
    /// of waiting for the next reaper tick.
    fn still_running(&self, job_id: &str, found: FoundProcess) -> bool {
        match found.origin {
            ProcessOrigin::Registry => Self::reap_entry(&self.inner, job_id),
            ProcessOrigin::Adopted => pid_alive(found.pid),
        }
    }

    async fn reaper_loop(inner: Arc<SupervisorInner>, reap_interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(reap_interval) => {}
                _ = inner.shutdown_notify.notified() => {}
            }
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let job_ids: Vec<String> = {
                let registry = lock_unpoisoned(&inner.registry);
                registry.keys().cloned().collect()
            };
            for job_id in job_ids {
                Self::reap_entry(&inner, &job_id);
            }
        }
    }

    /// Non-blocking wait on one registry entry. Returns whether the entry is
    /// still alive; an exited or vanished child is removed and published.
    fn reap_entry(inner: &SupervisorInner, job_id: &str) -> bool {
        let mut registry = lock_unpoisoned(&inner.registry);
        let Some(entry) = registry.get_mut(job_id) else {
            return false;
        };
        match entry.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                let pid = entry.pid;
                registry.remove(job_id);
                drop(registry);
                debug!(job_id, pid, ?status, "reaped child process");
                Self::publish(
                    inner,
                    ReapEvent {
                        job_id: job_id.to_string(),
                        pid,
                        outcome: ReapOutcome::Exited(status),
                    },
                );
                false
            }
            Err(error) => {
                let pid = entry.pid;
                registry.remove(job_id);
                drop(registry);
                warn!(job_id, pid, %error, "child exit status could not be collected");
                Self::publish(
                    inner,
                    ReapEvent {
                        job_id: job_id.to_string(),
                        pid,
                        outcome: ReapOutcome::Vanished,
                    },
                );
                false
            }
        }
    }
}

impl ProcessSupervisor {
    fn publish(inner: &SupervisorInner, event: ReapEvent) {
        {
            let mut recent_exits = lock_unpoisoned(&inner.recent_exits);
            recent_exits.insert(event.job_id.clone(), event.clone());
        }
        let _ = inner.events.send(event);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reaper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn open_truncated(path: &std::path::Path) -> Result<std::fs::File, SpawnError> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| SpawnError::LogUnwritable {
            path: path.to_path_buf(),
            source,
        })
}

fn classify_spawn_error(error: std::io::Error) -> SpawnError {
    match error.kind() {
        std::io::ErrorKind::NotFound => SpawnError::ExecutableNotFound("sh".to_string()),
        std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied("sh".to_string()),
        _ => SpawnError::ForkFailed(error),
    }
}

/// Signal-0 probe. True for zombies as well, which is fine: the reaper's
/// non-blocking wait resolves those within one tick.
fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Compares a live process's command line against the persisted command.
///
/// Children launch as `sh -c <command>`, but the shell exec-replaces itself
/// for simple commands, so the command may appear either as one argv entry
/// or as the whole argv. Space-joining covers both shapes.
fn cmdline_matches(pid: u32, command: &str) -> bool {
    if command.is_empty() {
        return false;
    }
    let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let joined = raw
        .split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    joined.contains(command)
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
