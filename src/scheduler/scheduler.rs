use super::handle::{SchedulerCommand, SchedulerError, SchedulerHandle, TaskSpec};
use crate::task_store::{StatusMask, StoreError, Task, TaskStatus, TaskSummary, TaskStore};
use crate::worker_pool::{PoolHandle, TaskEvent, WorkerError, WorkerRegistry};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consecutive storage failures tolerated before the scheduler gives up
/// and trips the shutdown token.
const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 5;

/// How long a graceful drain waits before aborting in-flight tasks, and
/// how long it then waits for the aborts to land.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Drives tasks through their lifecycle: polls the store for due work,
/// dispatches it to the worker pool, and records the outcomes.
pub struct Scheduler {
    task_store: Arc<dyn TaskStore>,
    registry: Arc<RwLock<WorkerRegistry>>,
    pool: PoolHandle,
    event_rx: mpsc::Receiver<TaskEvent>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    shutdown_token: CancellationToken,
    poll_interval: Duration,
    purge_interval: Duration,
    /// Ids currently dispatched to the pool, tracked for the drain.
    in_flight: HashSet<String>,
    consecutive_storage_failures: u32,
}

/// Create a scheduler and a handle for interacting with it.
pub fn create_scheduler(
    task_store: Arc<dyn TaskStore>,
    registry: Arc<RwLock<WorkerRegistry>>,
    pool: PoolHandle,
    event_rx: mpsc::Receiver<TaskEvent>,
    shutdown_token: CancellationToken,
    poll_interval: Duration,
    purge_interval: Duration,
) -> (Scheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);

    let scheduler = Scheduler {
        task_store,
        registry,
        pool,
        event_rx,
        command_rx,
        shutdown_token,
        poll_interval,
        purge_interval,
        in_flight: HashSet::new(),
        consecutive_storage_failures: 0,
    };

    (scheduler, SchedulerHandle::new(command_tx))
}

/// Derive a deterministic task id from worker name and options, so the
/// same periodic task submitted twice collides instead of duplicating.
pub fn fingerprint_task_id(
    worker_name: &str,
    options: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(worker_name.as_bytes());
    hasher.update(serde_json::to_string(options).unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl Scheduler {
    /// Main scheduler loop.
    pub async fn run(&mut self) {
        info!("Starting task scheduler");

        // On startup: rerun tasks left Queued/Doing by a previous run and
        // settle interrupted aborts as Aborted
        let now = Utc::now();
        match self.task_store.recover(
            StatusMask::IN_FLIGHT,
            StatusMask::of(TaskStatus::Abort),
            TaskStatus::Todo,
            now,
        ) {
            Ok(count) if count > 0 => {
                info!("Recovered {} tasks stuck from a previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to recover stuck tasks: {}", e);
            }
        }

        let mut poll_tick = tokio::time::interval(self.poll_interval);
        let mut purge_tick = tokio::time::interval(self.purge_interval);
        // Consume the immediate first tick so purging starts one interval in
        purge_tick.tick().await;

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    self.run_due_tasks().await;
                }
                _ = purge_tick.tick() => {
                    self.purge_expired();
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                }
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.drain().await;
                    break;
                }
            }
        }

        info!("Task scheduler stopped");
    }

    /// Select due tasks and hand them to the pool. Completed periodic
    /// tasks sit back in Todo with an advanced start time, so both polls
    /// only look at pending statuses.
    async fn run_due_tasks(&mut self) {
        let now = Utc::now();

        let one_shot = match self.task_store.list_to_do(StatusMask::PENDING, now, false) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.note_storage_failure("due-task poll", e);
                return;
            }
        };
        let periodic = match self.task_store.list_to_do(StatusMask::PENDING, now, true) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.note_storage_failure("due-task poll", e);
                return;
            }
        };
        self.consecutive_storage_failures = 0;

        for mut task in one_shot.into_iter().chain(periodic) {
            if self.in_flight.contains(&task.id) {
                continue;
            }
            task.status = TaskStatus::Queued;
            if let Err(e) = self.task_store.update(&task) {
                error!("Failed to mark task {} queued: {}", task.id, e);
                continue;
            }
            debug!("Dispatching task {} to worker '{}'", task.id, task.worker_name);
            self.in_flight.insert(task.id.clone());
            if let Err(e) = self.pool.dispatch(task).await {
                error!("Failed to dispatch task to worker pool: {}", e);
            }
        }
    }

    /// Delete finished one-shot tasks whose retention has elapsed.
    fn purge_expired(&mut self) {
        let now = Utc::now();
        match self.task_store.purge(StatusMask::TERMINAL, now) {
            Ok(0) => {}
            Ok(count) => info!("Purged {} expired tasks", count),
            Err(e) => {
                self.note_storage_failure("purge", e);
                return;
            }
        }
        self.consecutive_storage_failures = 0;

        if let Ok(count) = self.task_store.count_by_status(StatusMask::ALL) {
            debug!("Task store holds {} tasks", count);
        }
    }

    fn handle_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Started { id } => {
                let mut task = match self.task_store.get(&id) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!("Started event for unreadable task {}: {}", id, e);
                        return;
                    }
                };
                // Only Queued moves to Doing; a task canceled while queued
                // keeps its Canceled status
                if task.status == TaskStatus::Queued {
                    task.status = TaskStatus::Doing;
                    if let Err(e) = self.task_store.update(&task) {
                        error!("Failed to mark task {} doing: {}", id, e);
                    }
                }
            }
            TaskEvent::Finished { id, result } => {
                self.in_flight.remove(&id);
                let mut task = match self.task_store.get(&id) {
                    Ok(task) => task,
                    Err(StoreError::NotFound(_)) => {
                        debug!("Finished event for task {} deleted meanwhile", id);
                        return;
                    }
                    Err(e) => {
                        warn!("Finished event for unreadable task {}: {}", id, e);
                        return;
                    }
                };
                if task.status == TaskStatus::Canceled {
                    debug!("Ignoring finish of canceled task {}", id);
                    return;
                }

                let now = Utc::now();
                let abort_requested = task.status == TaskStatus::Abort;
                match result {
                    Ok(output) => {
                        task.status = if abort_requested {
                            TaskStatus::Aborted
                        } else {
                            TaskStatus::Done
                        };
                        task.output = Some(output);
                    }
                    Err(WorkerError::Aborted) => {
                        task.status = TaskStatus::Aborted;
                        task.output = Some("aborted".to_string());
                    }
                    Err(e) => {
                        task.status = if abort_requested {
                            TaskStatus::Aborted
                        } else {
                            TaskStatus::Failed
                        };
                        task.output = Some(e.to_string());
                    }
                }
                task.stop_at = Some(now);
                info!("Task {} finished: {}", id, task.status.as_str());
                // Re-arm periodic tasks: back to Todo with the start time
                // advanced. An explicit abort retires them instead.
                if task.is_periodic() && !abort_requested {
                    task.status = TaskStatus::Todo;
                    task.start_at = now + chrono::Duration::seconds(task.redo_interval);
                }
                if let Err(e) = self.task_store.update(&task) {
                    error!("Failed to record finish of task {}: {}", id, e);
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Schedule { spec, response } => {
                let result = self.schedule_task(spec).await;
                let _ = response.send(result);
            }
            SchedulerCommand::List { response } => {
                let result = self
                    .task_store
                    .list()
                    .map(|tasks| tasks.iter().map(TaskSummary::from).collect())
                    .map_err(SchedulerError::Store);
                let _ = response.send(result);
            }
            SchedulerCommand::Cancel { id, response } => {
                let result = self.cancel_task(&id).await;
                let _ = response.send(result);
            }
        }
    }

    async fn schedule_task(&mut self, spec: TaskSpec) -> Result<String, SchedulerError> {
        if !self.registry.read().await.contains(&spec.worker_name) {
            return Err(SchedulerError::UnknownWorker(spec.worker_name));
        }

        let now = Utc::now();
        let start_at = spec.start_at.unwrap_or(now);
        let id = match spec.id {
            Some(id) => id,
            None if spec.redo_interval > 0 => {
                fingerprint_task_id(&spec.worker_name, &spec.options)
            }
            None => Uuid::new_v4().to_string(),
        };

        let task = Task {
            id: id.clone(),
            worker_name: spec.worker_name,
            start_at,
            stop_at: None,
            status: if start_at <= now {
                TaskStatus::Todo
            } else {
                TaskStatus::Scheduled
            },
            output: None,
            options: spec.options,
            redo_interval: spec.redo_interval,
            expire: spec.expire,
        };

        match self.task_store.insert(&task) {
            Ok(()) => {
                info!(
                    "Scheduled task {} for worker '{}' at {}",
                    id, task.worker_name, task.start_at
                );
                Ok(id)
            }
            Err(StoreError::DuplicateId(_)) => Err(SchedulerError::AlreadyScheduled(id)),
            Err(e) => Err(SchedulerError::Store(e)),
        }
    }

    async fn cancel_task(&mut self, id: &str) -> Result<(), SchedulerError> {
        let mut task = match self.task_store.get(id) {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => return Err(SchedulerError::NotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        match task.status {
            TaskStatus::Todo | TaskStatus::Scheduled => {
                task.status = TaskStatus::Canceled;
                task.stop_at = Some(now);
                self.task_store.update(&task)?;
                info!("Canceled pending task {}", id);
                Ok(())
            }
            TaskStatus::Queued => {
                task.status = TaskStatus::Canceled;
                task.stop_at = Some(now);
                self.task_store.update(&task)?;
                // Keep it from starting once it reaches the front of its queue
                self.pool.abort(id).await;
                info!("Canceled queued task {}", id);
                Ok(())
            }
            TaskStatus::Doing => {
                task.status = TaskStatus::Abort;
                self.task_store.update(&task)?;
                self.pool.abort(id).await;
                info!("Abort requested for running task {}", id);
                Ok(())
            }
            // Abort already requested, nothing more to do
            TaskStatus::Abort => Ok(()),
            TaskStatus::Done
            | TaskStatus::Failed
            | TaskStatus::Canceled
            | TaskStatus::Aborted => Err(SchedulerError::AlreadyFinished(id.to_string())),
        }
    }

    fn note_storage_failure(&mut self, op: &str, e: StoreError) {
        error!("Task store failure during {}: {}", op, e);
        if !matches!(e, StoreError::Storage { .. }) {
            return;
        }
        self.consecutive_storage_failures += 1;
        if self.consecutive_storage_failures >= MAX_CONSECUTIVE_STORAGE_FAILURES {
            error!(
                "Task store failed {} consecutive times, shutting down",
                self.consecutive_storage_failures
            );
            self.shutdown_token.cancel();
        }
    }

    /// Wait for in-flight tasks after a shutdown signal. Aborts whatever is
    /// still running once the drain timeout passes.
    async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        info!(
            "Waiting for {} in-flight tasks to finish",
            self.in_flight.len()
        );

        let mut deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        let mut aborted = false;
        while !self.in_flight.is_empty() {
            let event = tokio::select! {
                event = self.event_rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    if aborted {
                        warn!("Giving up on {} in-flight tasks", self.in_flight.len());
                        return;
                    }
                    warn!(
                        "Drain timed out, aborting {} in-flight tasks",
                        self.in_flight.len()
                    );
                    self.pool.abort_all().await;
                    aborted = true;
                    deadline = tokio::time::Instant::now() + ABORT_GRACE;
                    continue;
                }
            };
            match event {
                Some(event) => self.handle_event(event),
                None => return,
            }
        }
        info!("All in-flight tasks finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::SqliteTaskStore;
    use crate::worker_pool::{
        create_worker_pool, Worker, WorkerContext, WorkerSet,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct EchoWorker;

    impl Worker for EchoWorker {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn execute(
            &self,
            _ctx: &WorkerContext,
            options: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String, WorkerError> {
            match options.get("msg").and_then(|v| v.as_str()) {
                Some(msg) => Ok(msg.to_string()),
                None => Ok("done".to_string()),
            }
        }
    }

    struct CountingWorker {
        count: Arc<AtomicUsize>,
    }

    impl Worker for CountingWorker {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn execute(
            &self,
            _ctx: &WorkerContext,
            _options: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String, WorkerError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("run {}", n))
        }
    }

    struct StubbornWorker;

    impl Worker for StubbornWorker {
        fn name(&self) -> &'static str {
            "stubborn"
        }

        fn execute(
            &self,
            ctx: &WorkerContext,
            _options: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String, WorkerError> {
            for _ in 0..200 {
                if ctx.is_cancelled() {
                    return Err(WorkerError::Aborted);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok("outlasted".to_string())
        }
    }

    struct TestHarness {
        store: Arc<dyn TaskStore>,
        handle: SchedulerHandle,
        shutdown_token: CancellationToken,
        _temp_dir: TempDir,
    }

    async fn start_harness(workers: Vec<Arc<dyn Worker>>) -> TestHarness {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::new(temp_dir.path().join("tasks.db")).unwrap());

        let mut registry = WorkerRegistry::new();
        let mut set = WorkerSet::new("test");
        for worker in workers {
            set.add(worker);
        }
        registry.add_set(set).unwrap();
        let registry = Arc::new(RwLock::new(registry));

        let shutdown_token = CancellationToken::new();
        let (pool, pool_handle, event_rx) = create_worker_pool(
            Arc::clone(&registry),
            Arc::clone(&store),
            shutdown_token.clone(),
        );
        let (mut scheduler, handle) = create_scheduler(
            Arc::clone(&store),
            registry,
            pool_handle,
            event_rx,
            shutdown_token.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        tokio::spawn(pool.run());
        tokio::spawn(async move { scheduler.run().await });

        TestHarness {
            store,
            handle,
            shutdown_token,
            _temp_dir: temp_dir,
        }
    }

    fn spec(worker_name: &str) -> TaskSpec {
        TaskSpec {
            worker_name: worker_name.to_string(),
            options: serde_json::Map::new(),
            start_at: None,
            redo_interval: 0,
            expire: 3600,
            id: None,
        }
    }

    async fn wait_for_status(
        store: &Arc<dyn TaskStore>,
        id: &str,
        status: TaskStatus,
    ) -> Task {
        for _ in 0..100 {
            if let Ok(task) = store.get(id) {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} never reached status {:?}", id, status);
    }

    #[tokio::test]
    async fn test_one_shot_runs_to_done() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let mut spec = spec("echo");
        spec.options
            .insert("msg".to_string(), serde_json::json!("hello"));
        let id = harness.handle.schedule(spec).await.unwrap();

        let task = wait_for_status(&harness.store, &id, TaskStatus::Done).await;
        assert_eq!(task.output.as_deref(), Some("hello"));
        assert!(task.stop_at.is_some());
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_one_shot_purged_after_retention() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let mut spec = spec("echo");
        spec.expire = 0; // no retention: purged at the first purge tick
        let id = harness.handle.schedule(spec).await.unwrap();

        wait_for_status(&harness.store, &id, TaskStatus::Done).await;

        let mut purged = false;
        for _ in 0..100 {
            if !harness.store.exists(&id).unwrap() {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(purged, "finished one-shot task was never purged");
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_future_task_stays_scheduled() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let mut spec = spec("echo");
        spec.start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        let id = harness.handle.schedule(spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let task = harness.store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.output.is_none());
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_periodic_task_reruns() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start_harness(vec![Arc::new(CountingWorker {
            count: count.clone(),
        })])
        .await;

        let mut spec = spec("counting");
        spec.redo_interval = 1;
        let id = harness.handle.schedule(spec).await.unwrap();

        let mut runs = 0;
        for _ in 0..200 {
            runs = count.load(Ordering::SeqCst);
            if runs >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(runs >= 2, "periodic task ran {} times", runs);

        // Still present, never purged, start time advanced past the last stop
        let task = harness.store.get(&id).unwrap();
        assert!(task.is_periodic());
        if let Some(stop_at) = task.stop_at {
            assert!(task.start_at > stop_at);
        }
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_periodic_task_rests_in_todo_between_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start_harness(vec![Arc::new(CountingWorker {
            count: count.clone(),
        })])
        .await;

        // Long interval: after the first run the task just sits re-armed
        let mut spec = spec("counting");
        spec.redo_interval = 3600;
        let id = harness.handle.schedule(spec).await.unwrap();

        // The task starts out Todo, so wait for the first run to land
        let mut rested = None;
        for _ in 0..100 {
            if let Ok(task) = harness.store.get(&id) {
                if task.status == TaskStatus::Todo && task.stop_at.is_some() {
                    rested = Some(task);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let task = rested.expect("periodic task never re-armed");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(task.output.as_deref(), Some("run 1"));
        assert!(task.start_at > Utc::now());
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_periodic_resubmission_conflicts() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let mut first = spec("echo");
        first.redo_interval = 60;
        first.start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        let id = harness.handle.schedule(first.clone()).await.unwrap();

        let err = harness.handle.schedule(first).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyScheduled(other) if other == id));
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_unknown_worker_rejected() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let err = harness.handle.schedule(spec("no_such")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownWorker(name) if name == "no_such"));
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let mut spec = spec("echo");
        spec.start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        let id = harness.handle.schedule(spec).await.unwrap();

        harness.handle.cancel(&id).await.unwrap();
        let task = harness.store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.stop_at.is_some());

        // Canceling a finished task is an error
        let err = harness.handle.cancel(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyFinished(_)));
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_missing_task() {
        let harness = start_harness(vec![Arc::new(EchoWorker)]).await;

        let err = harness.handle.cancel("nope").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(id) if id == "nope"));
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_abort_running_task() {
        let harness = start_harness(vec![Arc::new(StubbornWorker)]).await;

        let id = harness.handle.schedule(spec("stubborn")).await.unwrap();
        wait_for_status(&harness.store, &id, TaskStatus::Doing).await;

        harness.handle.cancel(&id).await.unwrap();
        let task = wait_for_status(&harness.store, &id, TaskStatus::Aborted).await;
        assert!(task.stop_at.is_some());
        harness.shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_recovery_reruns_stuck_task() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("tasks.db");

        // Simulate a previous run that died mid-execution
        {
            let store = SqliteTaskStore::new(&db_path).unwrap();
            store
                .insert(&Task {
                    id: "stuck".to_string(),
                    worker_name: "echo".to_string(),
                    start_at: Utc::now() - chrono::Duration::seconds(60),
                    stop_at: None,
                    status: TaskStatus::Doing,
                    output: None,
                    options: serde_json::Map::new(),
                    redo_interval: 0,
                    expire: 3600,
                    })
                .unwrap();
        }

        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(&db_path).unwrap());
        let mut registry = WorkerRegistry::new();
        let mut set = WorkerSet::new("test");
        set.add(Arc::new(EchoWorker));
        registry.add_set(set).unwrap();
        let registry = Arc::new(RwLock::new(registry));

        let shutdown_token = CancellationToken::new();
        let (pool, pool_handle, event_rx) = create_worker_pool(
            Arc::clone(&registry),
            Arc::clone(&store),
            shutdown_token.clone(),
        );
        let (mut scheduler, _handle) = create_scheduler(
            Arc::clone(&store),
            registry,
            pool_handle,
            event_rx,
            shutdown_token.clone(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        tokio::spawn(pool.run());
        tokio::spawn(async move { scheduler.run().await });

        let task = wait_for_status(&store, "stuck", TaskStatus::Done).await;
        assert_eq!(task.output.as_deref(), Some("done"));
        shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_recovery_settles_aborting_task() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("tasks.db");

        // A previous run died while this task was being canceled
        {
            let store = SqliteTaskStore::new(&db_path).unwrap();
            store
                .insert(&Task {
                    id: "half_canceled".to_string(),
                    worker_name: "counting".to_string(),
                    start_at: Utc::now() - chrono::Duration::seconds(60),
                    stop_at: None,
                    status: TaskStatus::Abort,
                    output: None,
                    options: serde_json::Map::new(),
                    redo_interval: 0,
                    expire: 3600,
                })
                .unwrap();
        }

        let count = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(&db_path).unwrap());
        let mut registry = WorkerRegistry::new();
        let mut set = WorkerSet::new("test");
        set.add(Arc::new(CountingWorker {
            count: count.clone(),
        }));
        registry.add_set(set).unwrap();
        let registry = Arc::new(RwLock::new(registry));

        let shutdown_token = CancellationToken::new();
        let (pool, pool_handle, event_rx) = create_worker_pool(
            Arc::clone(&registry),
            Arc::clone(&store),
            shutdown_token.clone(),
        );
        let (mut scheduler, _handle) = create_scheduler(
            Arc::clone(&store),
            registry,
            pool_handle,
            event_rx,
            shutdown_token.clone(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        tokio::spawn(pool.run());
        tokio::spawn(async move { scheduler.run().await });

        let task = wait_for_status(&store, "half_canceled", TaskStatus::Aborted).await;
        assert!(task.stop_at.is_some());

        // The canceled work must never execute again
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get("half_canceled").unwrap().status,
            TaskStatus::Aborted
        );
        shutdown_token.cancel();
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let mut options = serde_json::Map::new();
        options.insert("dbname".to_string(), serde_json::json!("postgres"));

        let a = fingerprint_task_id("vacuum_db", &options);
        let b = fingerprint_task_id("vacuum_db", &options);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = fingerprint_task_id("analyze_db", &options);
        assert_ne!(a, c);
    }
}
