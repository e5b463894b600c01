//! End-to-end tests wiring real components together: SQLite task store,
//! worker pool, scheduler and the control socket, exercised the way the
//! daemon and CLI use them.

use chrono::Utc;
use pgsteward::control::{run_control_server, ControlClient, ControlRequest, ControlResponse};
use pgsteward::scheduler::create_scheduler;
use pgsteward::task_store::{SqliteTaskStore, TaskStore};
use pgsteward::worker_pool::{
    create_worker_pool, Worker, WorkerContext, WorkerError, WorkerRegistry, WorkerSet,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

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

struct TickWorker {
    runs: Arc<AtomicUsize>,
}

impl Worker for TickWorker {
    fn name(&self) -> &'static str {
        "tick"
    }

    fn execute(
        &self,
        _ctx: &WorkerContext,
        _options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, WorkerError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("tick {}", n))
    }
}

struct TestAgent {
    store: Arc<dyn TaskStore>,
    socket_path: PathBuf,
    shutdown_token: CancellationToken,
    tick_runs: Arc<AtomicUsize>,
    _temp_dir: TempDir,
}

impl TestAgent {
    async fn spawn() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::new(temp_dir.path().join("tasks.db")).unwrap());

        let tick_runs = Arc::new(AtomicUsize::new(0));
        let mut set = WorkerSet::new("test");
        set.add(Arc::new(EchoWorker));
        set.add(Arc::new(TickWorker {
            runs: Arc::clone(&tick_runs),
        }));
        let mut registry = WorkerRegistry::new();
        registry.add_set(set).unwrap();
        let registry = Arc::new(RwLock::new(registry));

        let shutdown_token = CancellationToken::new();
        let (pool, pool_handle, event_rx) = create_worker_pool(
            Arc::clone(&registry),
            Arc::clone(&store),
            shutdown_token.clone(),
        );
        let (mut scheduler, scheduler_handle) = create_scheduler(
            Arc::clone(&store),
            registry,
            pool_handle,
            event_rx,
            shutdown_token.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        let socket_path = temp_dir.path().join("control.sock");
        tokio::spawn(pool.run());
        tokio::spawn(async move { scheduler.run().await });
        run_control_server(&socket_path, scheduler_handle, shutdown_token.clone()).unwrap();

        Self {
            store,
            socket_path,
            shutdown_token,
            tick_runs,
            _temp_dir: temp_dir,
        }
    }

    async fn client(&self) -> ControlClient {
        ControlClient::connect(&self.socket_path).await.unwrap()
    }

    async fn submit(&self, request: ControlRequest) -> ControlResponse {
        self.client().await.send(&request).await.unwrap()
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn task_new(worker_name: &str) -> ControlRequest {
    ControlRequest::TaskNew {
        worker_name: worker_name.to_string(),
        options: serde_json::Map::new(),
        start_at: None,
        redo_interval: 0,
        expire: 3600,
        id: None,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_submitted_task_runs_to_done_with_output() {
    let agent = TestAgent::spawn().await;

    let mut options = serde_json::Map::new();
    options.insert("msg".to_string(), serde_json::json!("hello agent"));
    let response = agent
        .submit(ControlRequest::TaskNew {
            worker_name: "echo".to_string(),
            options,
            start_at: None,
            redo_interval: 0,
            expire: 3600,
            id: None,
        })
        .await;
    let id = match response {
        ControlResponse::Accepted { id } => id,
        other => panic!("unexpected response: {:?}", other),
    };

    let store = Arc::clone(&agent.store);
    let check_id = id.clone();
    wait_until("task to finish", move || {
        store
            .get(&check_id)
            .map(|t| t.status.as_str() == "done")
            .unwrap_or(false)
    })
    .await;

    let task = agent.store.get(&id).unwrap();
    assert_eq!(task.output.as_deref(), Some("hello agent"));
    assert!(task.stop_at.is_some());
}

#[tokio::test]
async fn test_list_reflects_submitted_tasks() {
    let agent = TestAgent::spawn().await;

    let mut request = task_new("echo");
    if let ControlRequest::TaskNew { start_at, .. } = &mut request {
        // Keep it pending so the listing shows a stable status
        *start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
    }
    let id = match agent.submit(request).await {
        ControlResponse::Accepted { id } => id,
        other => panic!("unexpected response: {:?}", other),
    };

    let response = agent.submit(ControlRequest::TaskList).await;
    match response {
        ControlResponse::Tasks { tasks } => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].id, id);
            assert_eq!(tasks[0].worker_name, "echo");
            assert_eq!(tasks[0].status, "scheduled");
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_worker_reported_as_error() {
    let agent = TestAgent::spawn().await;

    let response = agent.submit(task_new("no_such_worker")).await;
    match response {
        ControlResponse::Error { message } => {
            assert!(message.contains("no_such_worker"));
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_periodic_submission_conflicts() {
    let agent = TestAgent::spawn().await;

    let mut request = task_new("echo");
    if let ControlRequest::TaskNew {
        redo_interval,
        start_at,
        ..
    } = &mut request
    {
        *redo_interval = 3600;
        *start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
    }

    let id = match agent.submit(request.clone()).await {
        ControlResponse::Accepted { id } => id,
        other => panic!("unexpected response: {:?}", other),
    };
    match agent.submit(request).await {
        ControlResponse::Conflict { id: other } => assert_eq!(other, id),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_pending_task_and_missing_task() {
    let agent = TestAgent::spawn().await;

    let mut request = task_new("echo");
    if let ControlRequest::TaskNew { start_at, .. } = &mut request {
        *start_at = Some(Utc::now() + chrono::Duration::seconds(3600));
    }
    let id = match agent.submit(request).await {
        ControlResponse::Accepted { id } => id,
        other => panic!("unexpected response: {:?}", other),
    };

    match agent.submit(ControlRequest::TaskCancel { id: id.clone() }).await {
        ControlResponse::Canceled { id: other } => assert_eq!(other, id),
        other => panic!("unexpected response: {:?}", other),
    }
    assert_eq!(agent.store.get(&id).unwrap().status.as_str(), "canceled");

    // A second cancel reports the task as already finished
    match agent.submit(ControlRequest::TaskCancel { id: id.clone() }).await {
        ControlResponse::AlreadyFinished { id: other } => assert_eq!(other, id),
        other => panic!("unexpected response: {:?}", other),
    }

    match agent
        .submit(ControlRequest::TaskCancel {
            id: "missing".to_string(),
        })
        .await
    {
        ControlResponse::NotFound { id } => assert_eq!(id, "missing"),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_periodic_task_keeps_running() {
    let agent = TestAgent::spawn().await;

    let mut request = task_new("tick");
    if let ControlRequest::TaskNew { redo_interval, .. } = &mut request {
        *redo_interval = 1;
    }
    match agent.submit(request).await {
        ControlResponse::Accepted { .. } => {}
        other => panic!("unexpected response: {:?}", other),
    }

    let runs = Arc::clone(&agent.tick_runs);
    wait_until("periodic task to run twice", move || {
        runs.load(Ordering::SeqCst) >= 2
    })
    .await;
}

#[tokio::test]
async fn test_finished_task_purged_after_retention() {
    let agent = TestAgent::spawn().await;

    let mut request = task_new("echo");
    if let ControlRequest::TaskNew { expire, .. } = &mut request {
        *expire = 0;
    }
    let id = match agent.submit(request).await {
        ControlResponse::Accepted { id } => id,
        other => panic!("unexpected response: {:?}", other),
    };

    let store = Arc::clone(&agent.store);
    wait_until("task to be purged", move || {
        !store.exists(&id).unwrap_or(true)
    })
    .await;
}
