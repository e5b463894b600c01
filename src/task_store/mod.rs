mod models;
mod schema;
mod sqlite_task_store;

pub use models::{StatusMask, Task, TaskStatus, TaskSummary};
pub use schema::TASK_VERSIONED_SCHEMAS;
pub use sqlite_task_store::SqliteTaskStore;

use chrono::{DateTime, Utc};

/// Errors surfaced by task store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A task with this id already exists. Distinct so callers can treat a
    /// re-submission as "already scheduled" instead of a failure.
    #[error("task {0} already exists")]
    DuplicateId(String),

    #[error("task {0} not found")]
    NotFound(String),

    /// The options column of this row is not valid JSON.
    #[error("task {id} has corrupt options: {source}")]
    CorruptOptions {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Any other storage failure, tagged with the attempted operation.
    #[error("task store {op} failed: {source}")]
    Storage {
        op: &'static str,
        id: Option<String>,
        #[source]
        source: rusqlite::Error,
    },
}

/// Persistence interface for tasks.
///
/// All datetimes are UTC; callers pass `now` explicitly so time-dependent
/// queries stay deterministic under test.
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with [`StoreError::DuplicateId`] if the id
    /// is already taken.
    fn insert(&self, task: &Task) -> Result<(), StoreError>;

    /// Overwrite the mutable fields of an existing task by id.
    fn update(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete a task. Deleting an absent id is not an error.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Fetch a single task.
    fn get(&self, id: &str) -> Result<Task, StoreError>;

    /// List all tasks. Rows with corrupt options are skipped, never abort
    /// the whole listing.
    fn list(&self) -> Result<Vec<Task>, StoreError>;

    fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Count tasks whose status is in the mask.
    fn count_by_status(&self, mask: StatusMask) -> Result<u64, StoreError>;

    /// Reset every task whose status is in `in_flight` back to `reset`, and
    /// settle every task in `aborting` as [`TaskStatus::Aborted`], stamping
    /// `stop_at = now` on both. Used at boot so nothing stays stuck in
    /// Queued/Doing/Abort after a crash; a task that was being canceled
    /// stays canceled rather than running again. Idempotent.
    fn recover(
        &self,
        in_flight: StatusMask,
        aborting: StatusMask,
        reset: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// List tasks that are due: status in the mask, `start_at <= now`, and
    /// one-shot (`redo == false`) or periodic (`redo == true`).
    fn list_to_do(
        &self,
        mask: StatusMask,
        now: DateTime<Utc>,
        redo: bool,
    ) -> Result<Vec<Task>, StoreError>;

    /// Delete finished one-shot tasks whose retention has elapsed:
    /// status in the mask, `redo_interval == 0`, `stop_at + expire <= now`.
    /// Periodic tasks are never purged. Returns the number deleted.
    fn purge(&self, mask: StatusMask, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete all tasks. Returns the number deleted.
    fn flush(&self) -> Result<u64, StoreError>;

    /// Compact the underlying storage.
    fn vacuum(&self) -> Result<(), StoreError>;
}
