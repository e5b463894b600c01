use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Lifecycle state of a task. A task carries exactly one status at a time;
/// each variant maps to a single bit so sets of statuses can be expressed
/// as a [`StatusMask`] in store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Due for execution as soon as a poll tick sees it.
    Todo,
    /// Accepted, start time is in the future.
    Scheduled,
    /// Handed to the worker pool, waiting for a slot.
    Queued,
    /// Currently executing.
    Doing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Canceled before execution started.
    Canceled,
    /// Execution was interrupted.
    Aborted,
    /// Cancellation requested while executing; transient, resolves to Aborted.
    Abort,
}

impl TaskStatus {
    pub const fn bit(self) -> u16 {
        match self {
            TaskStatus::Todo => 1,
            TaskStatus::Scheduled => 2,
            TaskStatus::Queued => 4,
            TaskStatus::Doing => 8,
            TaskStatus::Done => 16,
            TaskStatus::Failed => 32,
            TaskStatus::Canceled => 64,
            TaskStatus::Aborted => 128,
            TaskStatus::Abort => 256,
        }
    }

    pub fn from_bit(bit: u16) -> Option<Self> {
        match bit {
            1 => Some(TaskStatus::Todo),
            2 => Some(TaskStatus::Scheduled),
            4 => Some(TaskStatus::Queued),
            8 => Some(TaskStatus::Doing),
            16 => Some(TaskStatus::Done),
            32 => Some(TaskStatus::Failed),
            64 => Some(TaskStatus::Canceled),
            128 => Some(TaskStatus::Aborted),
            256 => Some(TaskStatus::Abort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Abort => "abort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "scheduled" => Some(TaskStatus::Scheduled),
            "queued" => Some(TaskStatus::Queued),
            "doing" => Some(TaskStatus::Doing),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            "aborted" => Some(TaskStatus::Aborted),
            "abort" => Some(TaskStatus::Abort),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Aborted
        )
    }
}

/// A set of task statuses, used for store queries. Distinct from
/// [`TaskStatus`]: a task always has exactly one status, a mask matches
/// any number of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMask(u16);

impl StatusMask {
    pub const EMPTY: StatusMask = StatusMask(0);

    /// Waiting for their start time.
    pub const PENDING: StatusMask =
        StatusMask(TaskStatus::Todo.bit() | TaskStatus::Scheduled.bit());

    /// Dispatched but not finished.
    pub const IN_FLIGHT: StatusMask =
        StatusMask(TaskStatus::Queued.bit() | TaskStatus::Doing.bit());

    /// Finished one way or another.
    pub const TERMINAL: StatusMask = StatusMask(
        TaskStatus::Done.bit()
            | TaskStatus::Failed.bit()
            | TaskStatus::Canceled.bit()
            | TaskStatus::Aborted.bit(),
    );

    pub const ALL: StatusMask = StatusMask(511);

    pub const fn of(status: TaskStatus) -> Self {
        StatusMask(status.bit())
    }

    pub fn contains(&self, status: TaskStatus) -> bool {
        self.0 & status.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl BitOr for StatusMask {
    type Output = StatusMask;

    fn bitor(self, rhs: StatusMask) -> StatusMask {
        StatusMask(self.0 | rhs.0)
    }
}

impl From<TaskStatus> for StatusMask {
    fn from(status: TaskStatus) -> Self {
        StatusMask::of(status)
    }
}

/// A unit of deferred work tracked by the agent.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id, caller-supplied or derived from the task content.
    pub id: String,
    /// Name of the worker that executes this task.
    pub worker_name: String,
    /// Earliest time the task may run. Advanced by one redo interval after
    /// each run of a periodic task.
    pub start_at: DateTime<Utc>,
    /// Set when a run finishes or the task is reset by recovery.
    pub stop_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Worker-produced result of the last run.
    pub output: Option<String>,
    /// Opaque worker arguments, stored as JSON with caller key ordering.
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Seconds between runs; 0 means one-shot.
    pub redo_interval: i64,
    /// Seconds a finished one-shot task is retained before purge.
    pub expire: i64,
}

impl Task {
    pub fn is_periodic(&self) -> bool {
        self.redo_interval > 0
    }
}

/// Projection of a task for list responses on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub worker_name: String,
    pub status: String,
    pub start_at: String,
    pub stop_at: Option<String>,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub output: Option<String>,
    pub redo_interval: i64,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        TaskSummary {
            id: task.id.clone(),
            worker_name: task.worker_name.clone(),
            status: task.status.as_str().to_string(),
            start_at: task.start_at.to_rfc3339(),
            stop_at: task.stop_at.map(|dt| dt.to_rfc3339()),
            options: task.options.clone(),
            output: task.output.clone(),
            redo_interval: task.redo_interval,
        }
    }
}
