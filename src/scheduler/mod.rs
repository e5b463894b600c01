//! Task scheduling and lifecycle management.
//!
//! The scheduler polls the task store for due work, dispatches it to the
//! worker pool and records outcomes. Submissions, listings and cancellations
//! arrive through a [`SchedulerHandle`] from the control channel and CLI.

mod handle;
#[allow(clippy::module_inception)]
mod scheduler;

pub use handle::{SchedulerCommand, SchedulerError, SchedulerHandle, TaskSpec};
pub use scheduler::{create_scheduler, fingerprint_task_id, Scheduler};
