//! Job lifecycle façade coordinating the record store and the process
//! supervisor.

use crate::supervisor::{
    lock_unpoisoned, ProcessSupervisor, ReapEvent, ReapOutcome, SpawnRequest, StopOutcome,
};
use anyhow::{bail, Context, Result};
use foreman_store::{JobFilter, JobRecord, JobStatus, JobStore, SqliteJobStore};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LOGS_SUBDIR: &str = "logs";
const DB_FILE: &str = "jobs.db";
const RELAUNCH_WAIT_MS: u64 = 10_000;
const RELAUNCH_POLL_MS: u64 = 50;

struct ManagerInner {
    logs_dir: PathBuf,
    store: Arc<dyn JobStore>,
    /// One async mutex per job id; every status transition for an id runs
    /// under its lock, which is what makes "stop overrides reaper" hold.
    job_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Public façade over the supervisor and the record store.
///
/// Construct one per base directory; persistent state (records and logs)
/// outlives the manager, so a fresh manager on the same directory sees and
/// can adopt jobs launched by a previous one. Must be created inside a
/// Tokio runtime.
pub struct JobManager {
    inner: Arc<ManagerInner>,
    supervisor: Arc<ProcessSupervisor>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Opens (or creates) `<base>/jobs.db` and `<base>/logs/`, starts the
    /// supervisor's reaper and the reap-event consumer.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::build(base_dir.as_ref(), None)
    }

    pub(crate) fn with_reap_interval(
        base_dir: impl AsRef<Path>,
        reap_interval: Duration,
    ) -> Result<Self> {
        Self::build(base_dir.as_ref(), Some(reap_interval))
    }

    fn build(base_dir: &Path, reap_interval: Option<Duration>) -> Result<Self> {
        let logs_dir = base_dir.join(LOGS_SUBDIR);
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteJobStore::new(base_dir.join(DB_FILE)).context("failed to open job database")?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(match reap_interval {
            None => ProcessSupervisor::new(Arc::clone(&store), events_tx),
            Some(interval) => {
                ProcessSupervisor::with_reap_interval(Arc::clone(&store), events_tx, interval)
            }
        });

        let inner = Arc::new(ManagerInner {
            logs_dir,
            store,
            job_locks: Mutex::new(HashMap::new()),
        });
        let consumer_inner = Arc::clone(&inner);
        let consumer = tokio::spawn(async move {
            Self::consume_reap_events(consumer_inner, events_rx).await;
        });

        Ok(Self {
            inner,
            supervisor,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Launches `command` under the platform shell as job `job_id`,
    /// relaunching if the id is already known.
    ///
    /// A spawn failure is reported through the returned record
    /// (`failed_start`), not as an error; only validation and store failures
    /// error out.
    pub async fn run(
        &self,
        command: &str,
        job_id: &str,
        cwd: Option<&Path>,
    ) -> Result<JobRecord> {
        let command = command.trim();
        if command.is_empty() {
            bail!("job command must be non-empty");
        }
        if job_id.trim().is_empty() {
            bail!("job id must be non-empty");
        }

        let lock = Self::job_lock(&self.inner, job_id);
        let _guard = lock.lock().await;

        let logfile = format!("job_{job_id}");
        let mut record = JobRecord::new(
            job_id,
            JobStatus::Starting,
            command,
            self.inner.logs_dir.clone(),
            logfile.clone(),
        );
        record.cwd = cwd.map(Path::to_path_buf);
        let mut record = self
            .inner
            .store
            .upsert(record)
            .await
            .context("failed to persist starting record")?;

        // One job id maps to at most one live process: take down any
        // survivor of a previous run before relaunching.
        if self.supervisor.registered(job_id).is_some() {
            debug!(job_id, "stopping live process of a previous run before relaunch");
            self.supervisor.stop(job_id).await;
            self.wait_for_reap(job_id).await;
        }

        let request = SpawnRequest {
            job_id: job_id.to_string(),
            command: command.to_string(),
            cwd: record.cwd.clone(),
            logdir: record.logdir.clone(),
            logfile,
            env: BTreeMap::new(),
        };
        match self.supervisor.spawn(request).await {
            Ok(spawned) => {
                record.status = JobStatus::Running;
                record.last_pid = spawned.pid;
                record.last_update = None;
                let record = self
                    .inner
                    .store
                    .upsert(record)
                    .await
                    .context("failed to persist running record")?;
                info!(job_id, pid = record.last_pid, command, "job running");
                Ok(record)
            }
            Err(error) => {
                warn!(job_id, %error, "job failed to start");
                record.status = JobStatus::FailedStart;
                record.last_update = None;
                let record = self
                    .inner
                    .store
                    .upsert(record)
                    .await
                    .context("failed to persist failed_start record")?;
                Ok(record)
            }
        }
    }

    /// Stops the job's process group and marks the record `stopped`.
    ///
    /// Returns `None` for an unknown id. Idempotent on terminal records: the
    /// existing record comes back unchanged and no signal is sent. Once this
    /// returns, no reap event can move the record off `stopped`.
    pub async fn stop(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let lock = Self::job_lock(&self.inner, job_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.inner.store.get(job_id).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(Some(record));
        }

        let outcome = self.supervisor.stop(job_id).await;
        if outcome == StopOutcome::NotFound {
            // The process beat us to the grave; the record still becomes
            // stopped, which is what the caller asked for.
            debug!(job_id, "stop found no live process");
        }
        record.status = JobStatus::Stopped;
        record.last_update = None;
        let record = self
            .inner
            .store
            .upsert(record)
            .await
            .context("failed to persist stopped record")?;
        info!(job_id, "job stopped");
        Ok(Some(record))
    }

    /// Reads the record, reconciling a `running` row against the OS first:
    /// when the supervisor cannot locate a live, command-line-verified
    /// process, the record is downgraded to `failed`. A reap event that
    /// collected a zero exit corrects that to `finished` when it lands.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let lock = Self::job_lock(&self.inner, job_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.inner.store.get(job_id).await? else {
            return Ok(None);
        };
        if record.status != JobStatus::Running {
            return Ok(Some(record));
        }
        if self.supervisor.find(job_id).await.is_some() {
            return Ok(Some(record));
        }

        // The process is gone. If the reaper already observed this spawn's
        // exit but the event lost the race to this read, honor its outcome;
        // otherwise the disappearance counts as a failure.
        let status = match self.supervisor.last_reap(job_id) {
            Some(event) if event.pid == record.last_pid => terminal_status(&event.outcome),
            _ => JobStatus::Failed,
        };
        warn!(
            job_id,
            pid = record.last_pid,
            status = status.as_str(),
            "running record has no live process; reconciling"
        );
        record.status = status;
        record.last_update = None;
        let record = self
            .inner
            .store
            .upsert(record)
            .await
            .context("failed to persist reconciled record")?;
        Ok(Some(record))
    }

    /// Lists records matching `filter`, keyed by job id. No per-row
    /// reconciliation; call `get_status` for authoritative state on one job.
    pub async fn list_status(
        &self,
        filter: Option<&JobFilter>,
    ) -> Result<BTreeMap<String, JobRecord>> {
        let default = JobFilter::default();
        let records = self
            .inner
            .store
            .list(filter.unwrap_or(&default))
            .await
            .context("failed to list job records")?;
        Ok(records
            .into_iter()
            .map(|record| (record.job_id.clone(), record))
            .collect())
    }

    /// Captured stdout/stderr of the most recent run. Missing log files
    /// degrade to in-band `error: could not open ...` strings.
    pub async fn job_logs(&self, job_id: &str) -> Result<(String, String)> {
        self.inner
            .store
            .logs(job_id)
            .await
            .with_context(|| format!("failed to read logs for job '{job_id}'"))
    }

    /// Stops the reaper and the event consumer. Live child processes are
    /// left running; their records keep the pids, so a later manager can
    /// adopt them.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        let handle = lock_unpoisoned(&self.consumer).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Waits for the reaper to observe the exit of a stopped predecessor so
    /// a relaunch never briefly has two processes registered under one id.
    async fn wait_for_reap(&self, job_id: &str) {
        let deadline = Instant::now() + Duration::from_millis(RELAUNCH_WAIT_MS);
        while self.supervisor.registered(job_id).is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(RELAUNCH_POLL_MS)).await;
        }
        if self.supervisor.registered(job_id).is_some() {
            warn!(job_id, "previous process still registered after stop; relaunching anyway");
        }
    }

    async fn consume_reap_events(
        inner: Arc<ManagerInner>,
        mut events: mpsc::UnboundedReceiver<ReapEvent>,
    ) {
        while let Some(event) = events.recv().await {
            // Each observation is applied on its own task: a job whose
            // per-job mutex is held through a slow relaunch must not stall
            // delivery for every other job behind it in the channel.
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(error) = Self::apply_reap_event(&inner, &event).await {
                    warn!(job_id = %event.job_id, %error, "failed to apply reap event");
                }
            });
        }
    }

    async fn apply_reap_event(inner: &ManagerInner, event: &ReapEvent) -> Result<()> {
        let lock = Self::job_lock(inner, &event.job_id);
        let _guard = lock.lock().await;

        let Some(mut record) = inner.store.get(&event.job_id).await? else {
            return Ok(());
        };
        if record.status == JobStatus::Stopped {
            debug!(job_id = %event.job_id, "suppressing reap event: an explicit stop already won");
            return Ok(());
        }
        if record.last_pid != event.pid {
            debug!(
                job_id = %event.job_id,
                event_pid = event.pid,
                record_pid = record.last_pid,
                "suppressing reap event from a previous spawn"
            );
            return Ok(());
        }

        record.status = terminal_status(&event.outcome);
        record.last_update = None;
        let record = inner.store.upsert(record).await?;
        info!(
            job_id = %record.job_id,
            status = record.status.as_str(),
            "applied reap event"
        );
        Ok(())
    }

    fn job_lock(inner: &ManagerInner, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock_unpoisoned(&inner.job_locks);
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }
}

fn terminal_status(outcome: &ReapOutcome) -> JobStatus {
    match outcome {
        ReapOutcome::Exited(status) if status.success() => JobStatus::Finished,
        ReapOutcome::Exited(_) | ReapOutcome::Vanished => JobStatus::Failed,
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.consumer.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobManager;
    use foreman_store::{JobFilter, JobStatus};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::time::Instant;

    fn manager(temp: &TempDir) -> JobManager {
        JobManager::with_reap_interval(temp.path(), Duration::from_millis(50)).expect("manager")
    }

    async fn wait_for_status(
        manager: &JobManager,
        job_id: &str,
        want: JobStatus,
        timeout: Duration,
    ) -> foreman_store::JobRecord {
        let deadline = Instant::now() + timeout;
        loop {
            let record = manager
                .get_status(job_id)
                .await
                .expect("get_status")
                .expect("record exists");
            if record.status == want {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "job '{job_id}' stuck in '{}' waiting for '{}'",
                record.status.as_str(),
                want.as_str()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_for_terminal(
        manager: &JobManager,
        job_id: &str,
        timeout: Duration,
    ) -> foreman_store::JobRecord {
        let deadline = Instant::now() + timeout;
        loop {
            let record = manager
                .get_status(job_id)
                .await
                .expect("get_status")
                .expect("record exists");
            if record.status.is_terminal() {
                return record;
            }
            assert!(Instant::now() < deadline, "job '{job_id}' never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn echo_runs_to_finished_and_captures_logs() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        let record = manager
            .run("echo hello", "j1", None)
            .await
            .expect("run echo");
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.last_pid > 0);

        wait_for_status(&manager, "j1", JobStatus::Finished, Duration::from_secs(10)).await;

        let (stdout, stderr) = manager.job_logs("j1").await.expect("job logs");
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_wins_over_the_reaper_and_sticks() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        manager
            .run("sleep 30", "j2", None)
            .await
            .expect("run sleep");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = manager
            .get_status("j2")
            .await
            .expect("get_status")
            .expect("record");
        assert_eq!(record.status, JobStatus::Running);

        let stopped = manager
            .stop("j2")
            .await
            .expect("stop")
            .expect("record exists");
        assert_eq!(stopped.status, JobStatus::Stopped);

        // Give the reaper several cycles to observe the exit; the record
        // must never move off stopped.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let after = manager
            .get_status("j2")
            .await
            .expect("get_status")
            .expect("record");
        assert_eq!(after.status, JobStatus::Stopped);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn missing_binary_ends_failed_with_stderr_output() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        manager
            .run("no_such_binary_xyz_429", "j3", None)
            .await
            .expect("run missing binary");
        let record = wait_for_terminal(&manager, "j3", Duration::from_secs(10)).await;
        assert!(
            matches!(record.status, JobStatus::Failed | JobStatus::FailedStart),
            "unexpected terminal status {}",
            record.status.as_str()
        );

        let (_, stderr) = manager.job_logs("j3").await.expect("job logs");
        assert!(!stderr.is_empty(), "shell should have reported the missing command");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn relaunch_truncates_previous_logs() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        manager.run("echo a", "j4", None).await.expect("first run");
        wait_for_status(&manager, "j4", JobStatus::Finished, Duration::from_secs(10)).await;

        manager.run("echo b", "j4", None).await.expect("second run");
        wait_for_status(&manager, "j4", JobStatus::Finished, Duration::from_secs(10)).await;

        let (stdout, _) = manager.job_logs("j4").await.expect("job logs");
        assert_eq!(stdout, "b\n");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_of_unknown_job_returns_none() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);
        assert!(manager.stop("no_such").await.expect("stop").is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_terminal_records() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        manager.run("echo done", "j6", None).await.expect("run");
        wait_for_status(&manager, "j6", JobStatus::Finished, Duration::from_secs(10)).await;

        let record = manager
            .stop("j6")
            .await
            .expect("stop")
            .expect("record exists");
        assert_eq!(record.status, JobStatus::Finished);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn run_validates_command_and_job_id() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        assert!(manager.run("   ", "j7", None).await.is_err());
        assert!(manager.run("echo hi", "  ", None).await.is_err());
        assert!(manager
            .list_status(None)
            .await
            .expect("list")
            .is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn run_rejects_invalid_working_directory_as_failed_start() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        let record = manager
            .run("echo hi", "j8", Some(&temp.path().join("missing-cwd")))
            .await
            .expect("run");
        assert_eq!(record.status, JobStatus::FailedStart);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn list_status_filter_returns_exact_matches() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        manager
            .run("sleep 30", "job_a", None)
            .await
            .expect("run job_a");
        manager.run("echo one", "job_b", None).await.expect("run job_b");
        manager.run("echo two", "job_c", None).await.expect("run job_c");
        wait_for_status(&manager, "job_b", JobStatus::Finished, Duration::from_secs(10)).await;
        wait_for_status(&manager, "job_c", JobStatus::Finished, Duration::from_secs(10)).await;

        let finished = manager
            .list_status(Some(&JobFilter::by_status(JobStatus::Finished)))
            .await
            .expect("list finished");
        let mut ids: Vec<&str> = finished.keys().map(String::as_str).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["job_b", "job_c"]);

        let running = manager
            .list_status(Some(&JobFilter::by_status(JobStatus::Running)))
            .await
            .expect("list running");
        assert_eq!(running.len(), 1);
        assert!(running.contains_key("job_a"));

        manager.stop("job_a").await.expect("stop job_a");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn relaunch_while_running_keeps_one_process_per_id() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        let first = manager
            .run("sleep 30", "j9", None)
            .await
            .expect("first run");
        let second = manager
            .run("sleep 30", "j9", None)
            .await
            .expect("second run");
        assert_ne!(first.last_pid, second.last_pid);

        // The first spawn's process group must be gone.
        let first_gone = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(first.last_pid as i32),
            None,
        )
        .is_err();
        assert!(first_gone, "first process survived the relaunch");

        let record = manager
            .get_status("j9")
            .await
            .expect("get_status")
            .expect("record");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.last_pid, second.last_pid);

        manager.stop("j9").await.expect("stop");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn one_jobs_slow_stop_does_not_stall_other_terminal_writes() {
        let temp = tempdir().expect("tempdir");
        let manager = std::sync::Arc::new(
            JobManager::with_reap_interval(temp.path(), Duration::from_millis(50))
                .expect("manager"),
        );

        // A shell that ignores SIGTERM forces the full polite-retry grace
        // before SIGKILL, keeping this job's mutex held for seconds at a
        // time.
        let stubborn_cmd = "trap '' TERM; while :; do sleep 1; done";
        manager
            .run(stubborn_cmd, "stubborn", None)
            .await
            .expect("first run");

        let relaunch = {
            let manager = std::sync::Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run("trap '' TERM; while :; do sleep 1; done", "stubborn", None)
                    .await
                    .expect("relaunch")
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Queued behind the relaunch on the same mutex, as is the first
        // spawn's reap event once that process finally dies.
        let stopper = {
            let manager = std::sync::Arc::clone(&manager);
            tokio::spawn(async move { manager.stop("stubborn").await.expect("stop") })
        };

        // By the time the first spawn's exit observation is waiting on the
        // contended mutex, an unrelated job's exit must still reach the
        // store.
        tokio::time::sleep(Duration::from_millis(4_700)).await;
        manager
            .run("echo done", "quick", None)
            .await
            .expect("run quick");

        // list_status does no reconciliation, so this only passes once the
        // reap event for "quick" has actually been applied.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let all = manager.list_status(None).await.expect("list");
            if all.get("quick").map(|record| record.status) == Some(JobStatus::Finished) {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "quick job's exit was not recorded while another job was stopping"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        relaunch.await.expect("join relaunch");
        let stopped = stopper
            .await
            .expect("join stopper")
            .expect("record exists");
        assert_eq!(stopped.status, JobStatus::Stopped);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_kill_converges_to_failed() {
        let temp = tempdir().expect("tempdir");
        let manager = manager(&temp);

        let record = manager
            .run("sleep 30", "j10", None)
            .await
            .expect("run sleep");
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(record.last_pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );

        let record = wait_for_terminal(&manager, "j10", Duration::from_secs(10)).await;
        assert_eq!(record.status, JobStatus::Failed);
        manager.shutdown().await;
    }
}
