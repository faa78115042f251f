//! SQLite-backed `JobStore` implementation with durable persistence.

use crate::{JobFilter, JobRecord, JobStatus, JobStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent SQLite store backend, one `process_status` table in a single
/// database file colocated with the job log directory.
#[derive(Debug)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    /// Returns the database file path.
    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS process_status (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_update TEXT NOT NULL,
                last_pid INTEGER NOT NULL,
                command TEXT NOT NULL,
                cwd TEXT NULL,
                logdir TEXT NOT NULL,
                logfile TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn upsert(&self, mut record: JobRecord) -> StoreResult<JobRecord> {
        record.validate()?;
        if record.last_update.is_none() {
            record.last_update = Some(Utc::now());
        }

        let connection = self.open_connection()?;
        // ON CONFLICT keeps the original rowid, so list order stays the
        // insertion order of each id's first upsert across relaunches.
        connection.execute(
            r#"
            INSERT INTO process_status (
                job_id, status, last_update, last_pid, command, cwd, logdir, logfile
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                last_update = excluded.last_update,
                last_pid = excluded.last_pid,
                command = excluded.command,
                cwd = excluded.cwd,
                logdir = excluded.logdir,
                logfile = excluded.logfile
            "#,
            params![
                record.job_id,
                status_to_db(record.status),
                option_timestamp_to_db(record.last_update),
                i64::from(record.last_pid),
                record.command,
                record.cwd.as_deref().map(path_to_db),
                path_to_db(&record.logdir),
                record.logfile,
            ],
        )?;
        Ok(record)
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                r#"
                SELECT job_id, status, last_update, last_pid, command, cwd, logdir, logfile
                FROM process_status
                WHERE job_id = ?1
                "#,
                params![job_id],
                row_to_tuple,
            )
            .optional()?
            .map(tuple_to_record)
            .transpose()
    }

    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<JobRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT job_id, status, last_update, last_pid, command, cwd, logdir, logfile
            FROM process_status
            ORDER BY rowid, job_id
            "#,
        )?;
        let rows = statement.query_map([], row_to_tuple)?;

        let mut records = Vec::new();
        for row in rows {
            let record = tuple_to_record(row?)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

type RowTuple = (
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    String,
    String,
);

fn row_to_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn tuple_to_record(
    (job_id, status, last_update, last_pid, command, cwd, logdir, logfile): RowTuple,
) -> StoreResult<JobRecord> {
    Ok(JobRecord {
        job_id,
        status: status_from_db(&status)?,
        last_update: Some(timestamp_from_db(&last_update)?),
        last_pid: i64_to_pid(last_pid)?,
        command,
        cwd: cwd.map(PathBuf::from),
        logdir: PathBuf::from(logdir),
        logfile,
    })
}

fn status_to_db(status: JobStatus) -> &'static str {
    status.as_str()
}

fn status_from_db(value: &str) -> StoreResult<JobStatus> {
    JobStatus::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "status",
        value: value.to_string(),
    })
}

fn path_to_db(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> String {
    timestamp_to_db(value.unwrap_or_else(Utc::now))
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn i64_to_pid(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field: "last_pid",
        value: value.to_string(),
    })
}
