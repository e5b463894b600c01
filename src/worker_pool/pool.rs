use super::registry::{Worker, WorkerContext, WorkerError, WorkerRegistry};
use crate::task_store::{Task, TaskStore};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Progress notification emitted by the pool for a dispatched task.
#[derive(Debug)]
pub enum TaskEvent {
    /// The task acquired a slot and started executing.
    Started { id: String },
    /// The task finished, successfully or not.
    Finished {
        id: String,
        result: Result<String, WorkerError>,
    },
}

/// Executes dispatched tasks on blocking threads, capped per worker name.
///
/// Isolation boundary: workers run inside `spawn_blocking`, so a panic is
/// caught at the join handle and reported as a [`WorkerError::Panic`]
/// instead of unwinding into the scheduler.
pub struct WorkerPool {
    registry: Arc<RwLock<WorkerRegistry>>,
    task_store: Arc<dyn TaskStore>,
    dispatch_rx: mpsc::Receiver<Task>,
    event_tx: mpsc::Sender<TaskEvent>,
    /// One semaphore per worker name, sized to the worker's pool_size.
    semaphores: HashMap<String, Arc<Semaphore>>,
    /// Cancellation tokens for dispatched tasks, shared with PoolHandle.
    cancel_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown_token: CancellationToken,
}

/// Handle for dispatching and aborting tasks on the pool.
#[derive(Clone)]
pub struct PoolHandle {
    dispatch_tx: mpsc::Sender<Task>,
    cancel_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl PoolHandle {
    pub async fn dispatch(&self, task: Task) -> Result<()> {
        self.dispatch_tx
            .send(task)
            .await
            .map_err(|_| anyhow!("Worker pool is not running"))
    }

    /// Cancel the token of a dispatched task. Returns false if the task is
    /// not currently known to the pool.
    pub async fn abort(&self, id: &str) -> bool {
        let tokens = self.cancel_tokens.lock().await;
        match tokens.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every dispatched task. Used when a graceful drain times out.
    pub async fn abort_all(&self) {
        let tokens = self.cancel_tokens.lock().await;
        for token in tokens.values() {
            token.cancel();
        }
    }
}

/// Create a worker pool together with its dispatch handle and the event
/// stream consumed by the scheduler.
pub fn create_worker_pool(
    registry: Arc<RwLock<WorkerRegistry>>,
    task_store: Arc<dyn TaskStore>,
    shutdown_token: CancellationToken,
) -> (WorkerPool, PoolHandle, mpsc::Receiver<TaskEvent>) {
    let (dispatch_tx, dispatch_rx) = mpsc::channel(100);
    let (event_tx, event_rx) = mpsc::channel(100);
    let cancel_tokens = Arc::new(Mutex::new(HashMap::new()));

    let pool = WorkerPool {
        registry,
        task_store,
        dispatch_rx,
        event_tx,
        semaphores: HashMap::new(),
        cancel_tokens: Arc::clone(&cancel_tokens),
        shutdown_token,
    };

    let handle = PoolHandle {
        dispatch_tx,
        cancel_tokens,
    };

    (pool, handle, event_rx)
}

impl WorkerPool {
    /// Main pool loop: accept dispatches until shutdown. Tasks already
    /// spawned keep running after the loop exits; the scheduler drains
    /// their events.
    pub async fn run(mut self) {
        info!("Worker pool started");
        loop {
            tokio::select! {
                Some(task) = self.dispatch_rx.recv() => {
                    self.spawn_task(task).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Worker pool received shutdown signal");
                    break;
                }
            }
        }
        info!("Worker pool stopped");
    }

    async fn spawn_task(&mut self, task: Task) {
        let worker: Option<Arc<dyn Worker>> =
            self.registry.read().await.get(&task.worker_name);
        let worker = match worker {
            Some(worker) => worker,
            None => {
                warn!(
                    "Task {} references unknown worker '{}'",
                    task.id, task.worker_name
                );
                let _ = self
                    .event_tx
                    .send(TaskEvent::Finished {
                        id: task.id,
                        result: Err(WorkerError::UnknownWorker(task.worker_name)),
                    })
                    .await;
                return;
            }
        };

        let semaphore = self
            .semaphores
            .entry(task.worker_name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(worker.pool_size().max(1))))
            .clone();

        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .await
            .insert(task.id.clone(), token.clone());

        let event_tx = self.event_tx.clone();
        let task_store = Arc::clone(&self.task_store);
        let cancel_tokens = Arc::clone(&self.cancel_tokens);
        let id = task.id;
        let options = task.options;

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            // Canceled while waiting for a slot: never started
            if token.is_cancelled() {
                cancel_tokens.lock().await.remove(&id);
                let _ = event_tx
                    .send(TaskEvent::Finished {
                        id,
                        result: Err(WorkerError::Aborted),
                    })
                    .await;
                return;
            }

            let _ = event_tx
                .send(TaskEvent::Started { id: id.clone() })
                .await;

            let ctx = WorkerContext::new(token, task_store);
            let start_time = Instant::now();
            let join = tokio::task::spawn_blocking(move || worker.execute(&ctx, &options)).await;
            let elapsed = start_time.elapsed();

            let result = match join {
                Ok(Ok(output)) => {
                    info!("Task {} completed in {:?}", id, elapsed);
                    Ok(output)
                }
                Ok(Err(WorkerError::Aborted)) => {
                    info!("Task {} aborted after {:?}", id, elapsed);
                    Err(WorkerError::Aborted)
                }
                Ok(Err(e)) => {
                    warn!("Task {} failed after {:?}: {}", id, elapsed, e);
                    Err(e)
                }
                Err(e) => {
                    error!("Task {} panicked after {:?}: {}", id, elapsed, e);
                    Err(WorkerError::Panic(e.to_string()))
                }
            };

            cancel_tokens.lock().await.remove(&id);
            let _ = event_tx.send(TaskEvent::Finished { id, result }).await;
        });
    }
}
