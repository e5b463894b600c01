use crate::task_store::{StoreError, TaskSummary};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

/// Errors surfaced by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A task with this id already exists; re-submitting the same work is
    /// not a failure, the caller just gets told it is already there.
    #[error("task {0} is already scheduled")]
    AlreadyScheduled(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already finished")]
    AlreadyFinished(String),

    #[error("no worker registered with name '{0}'")]
    UnknownWorker(String),

    #[error("scheduler is not available")]
    Unavailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything needed to create a task. The id is optional: one-shot tasks
/// get a random id, periodic tasks get a fingerprint of worker name and
/// options so re-submitting the same periodic work is idempotent.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub worker_name: String,
    pub options: serde_json::Map<String, serde_json::Value>,
    /// When the task becomes due; defaults to now.
    pub start_at: Option<DateTime<Utc>>,
    pub redo_interval: i64,
    pub expire: i64,
    pub id: Option<String>,
}

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    Schedule {
        spec: TaskSpec,
        response: oneshot::Sender<Result<String, SchedulerError>>,
    },
    List {
        response: oneshot::Sender<Result<Vec<TaskSummary>, SchedulerError>>,
    },
    Cancel {
        id: String,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
}

/// Handle to interact with the scheduler from the control channel and CLI.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn new(command_tx: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { command_tx }
    }

    /// Submit a task. Returns the id under which it was accepted.
    pub async fn schedule(&self, spec: TaskSpec) -> Result<String, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Schedule {
                spec,
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        response_rx.await.map_err(|_| SchedulerError::Unavailable)?
    }

    /// List all known tasks.
    pub async fn list(&self) -> Result<Vec<TaskSummary>, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::List {
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        response_rx.await.map_err(|_| SchedulerError::Unavailable)?
    }

    /// Cancel a task. Pending tasks go straight to Canceled; a running task
    /// gets an abort request and resolves to Aborted.
    pub async fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Cancel {
                id: id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        response_rx.await.map_err(|_| SchedulerError::Unavailable)?
    }
}
