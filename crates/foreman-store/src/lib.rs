//! Job record store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteJobStore;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("invalid job record: {0}")]
    Validation(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Enumerates the lifecycle states persisted for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record written, child process not yet launched.
    Starting,
    /// Child process launched and believed alive.
    Running,
    /// Child exited with status zero.
    Finished,
    /// Child exited non-zero, was killed, or disappeared after running.
    Failed,
    /// The launch itself failed before the child ever ran.
    FailedStart,
    /// An explicit stop request terminated the job.
    Stopped,
}

impl JobStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::FailedStart => "failed_start",
            Self::Stopped => "stopped",
        }
    }

    /// Parses a wire value back into a status.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "failed_start" => Some(Self::FailedStart),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Returns true when the job cannot transition any further without a
    /// fresh `run`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::FailedStart | Self::Stopped
        )
    }
}

/// Durable record persisted for each known job, keyed by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    /// `None` on input means "stamp with the current wall clock at write";
    /// records read back from a store always carry `Some`.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// OS pid of the most recent spawn, 0 if never spawned.
    #[serde(default)]
    pub last_pid: u32,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub logdir: PathBuf,
    /// Stem for the `<stem>.stdout` / `<stem>.stderr` log pair.
    pub logfile: String,
}

impl JobRecord {
    /// Creates a record in the given state with no pid and an unset
    /// timestamp.
    pub fn new(
        job_id: impl Into<String>,
        status: JobStatus,
        command: impl Into<String>,
        logdir: impl Into<PathBuf>,
        logfile: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            last_update: None,
            last_pid: 0,
            command: command.into(),
            cwd: None,
            logdir: logdir.into(),
            logfile: logfile.into(),
        }
    }

    /// Path of the captured stdout file for the most recent spawn.
    pub fn stdout_path(&self) -> PathBuf {
        self.logdir.join(format!("{}.stdout", self.logfile))
    }

    /// Path of the captured stderr file for the most recent spawn.
    pub fn stderr_path(&self) -> PathBuf {
        self.logdir.join(format!("{}.stderr", self.logfile))
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.job_id.trim().is_empty() {
            return Err(StoreError::Validation("job_id must be non-empty".into()));
        }
        Ok(())
    }
}

/// Partial record used as an ANDed equality predicate over `list`.
///
/// An unset field matches everything; an empty filter matches every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFilter {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub logfile: Option<String>,
}

impl JobFilter {
    /// Filter matching records in one status.
    pub fn by_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Filter matching a single job id.
    pub fn by_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    /// Evaluates whether a record satisfies every set field.
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.job_id
            .as_ref()
            .is_none_or(|job_id| job_id == &record.job_id)
            && self.status.is_none_or(|status| status == record.status)
            && self
                .last_pid
                .is_none_or(|last_pid| last_pid == record.last_pid)
            && self
                .command
                .as_ref()
                .is_none_or(|command| command == &record.command)
            && self.cwd.as_ref().is_none_or(|cwd| Some(cwd) == record.cwd.as_ref())
            && self
                .logdir
                .as_ref()
                .is_none_or(|logdir| logdir == &record.logdir)
            && self
                .logfile
                .as_ref()
                .is_none_or(|logfile| logfile == &record.logfile)
    }
}

/// Async store contract shared by the supervisor and the job manager.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts the record if `job_id` is new, otherwise replaces every field
    /// of the existing row. Stamps `last_update` with the current wall clock
    /// when the caller left it unset. Durable before return.
    async fn upsert(&self, record: JobRecord) -> StoreResult<JobRecord>;

    /// Loads a single record by id.
    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>>;

    /// Lists records matching the filter, in insertion order of each id's
    /// first upsert.
    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<JobRecord>>;

    /// Reads the captured stdout/stderr of the most recent spawn.
    ///
    /// A missing or unreadable log file degrades to an in-band
    /// `error: could not open <path>` string in that tuple slot; only a
    /// missing record is an error.
    async fn logs(&self, job_id: &str) -> StoreResult<(String, String)> {
        let record = self
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        Ok((
            read_log_or_sentinel(&record.stdout_path()),
            read_log_or_sentinel(&record.stderr_path()),
        ))
    }
}

fn read_log_or_sentinel(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => format!("error: could not open {}", path.display()),
    }
}

/// In-memory implementation for tests and embedders that do not need
/// persistence.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<String, JobRecord>,
    insertion_order: Vec<String>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, mut record: JobRecord) -> StoreResult<JobRecord> {
        record.validate()?;
        if record.last_update.is_none() {
            record.last_update = Some(Utc::now());
        }
        let mut inner = self.inner.write().await;
        if !inner.records.contains_key(&record.job_id) {
            inner.insertion_order.push(record.job_id.clone());
        }
        inner.records.insert(record.job_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<JobRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .insertion_order
            .iter()
            .filter_map(|job_id| inner.records.get(job_id))
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}
