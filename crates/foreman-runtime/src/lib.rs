//! Embedded job supervisor: runs shell commands as child processes, keeps
//! their lifecycle in a persistent store, and captures output to per-job
//! log files.
//!
//! [`JobManager`] is the entry point; it composes the [`supervisor`]'s
//! process registry and reaper with the record store from `foreman-store`.

pub mod manager;
pub mod supervisor;

pub use manager::JobManager;
pub use supervisor::{
    FoundProcess, ProcessOrigin, ProcessSupervisor, ReapEvent, ReapOutcome, SpawnError,
    SpawnRequest, SpawnedJob, StopOutcome,
};

pub use foreman_store::{
    JobFilter, JobRecord, JobStatus, JobStore, MemoryJobStore, SqliteJobStore, StoreError,
    StoreResult,
};
