//! PgSteward Host Agent Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod config;
pub mod control;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod task_store;
pub mod worker_pool;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig, FileConfig};
pub use scheduler::{create_scheduler, SchedulerError, SchedulerHandle, TaskSpec};
pub use task_store::{SqliteTaskStore, StatusMask, Task, TaskStatus, TaskStore};
pub use worker_pool::{create_worker_pool, Worker, WorkerRegistry, WorkerSet};
