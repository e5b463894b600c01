use crate::task_store::TaskStore;
use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error returned by a worker execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker registered with name '{0}'")]
    UnknownWorker(String),

    /// The worker observed its cancellation token and stopped early.
    #[error("aborted")]
    Aborted,

    #[error("{0}")]
    Failed(String),

    #[error("worker panicked: {0}")]
    Panic(String),
}

/// Shared context provided to workers during execution.
pub struct WorkerContext {
    /// Cancellation token specific to this task. Workers should check it
    /// at convenient points and return [`WorkerError::Aborted`] when set.
    pub cancellation_token: CancellationToken,

    pub task_store: Arc<dyn TaskStore>,
}

impl WorkerContext {
    pub fn new(cancellation_token: CancellationToken, task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            cancellation_token,
            task_store,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// A named piece of work the agent knows how to execute.
///
/// Workers are synchronous; the pool runs them on blocking threads so a
/// slow or crashing worker never takes the scheduler down with it.
pub trait Worker: Send + Sync {
    /// Unique name, referenced by tasks.
    fn name(&self) -> &'static str;

    /// How many tasks of this worker may run concurrently.
    fn pool_size(&self) -> usize {
        1
    }

    fn execute(
        &self,
        ctx: &WorkerContext,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, WorkerError>;
}

/// A named group of workers, registered and unregistered as a unit.
pub struct WorkerSet {
    name: String,
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerSet {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }
}

/// Description of a registered worker for listings.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub set: String,
    pub name: String,
    pub pool_size: usize,
}

/// Lookup table from worker name to worker, grouped by set so whole sets
/// can be added and removed at runtime.
#[derive(Default)]
pub struct WorkerRegistry {
    sets: HashMap<String, WorkerSet>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker set, replacing a previous set of the same name.
    /// Fails if another set already provides one of its worker names.
    pub fn add_set(&mut self, set: WorkerSet) -> Result<()> {
        for worker in set.workers() {
            for (other_name, other) in &self.sets {
                if other_name == set.name() {
                    continue;
                }
                if other.workers().iter().any(|w| w.name() == worker.name()) {
                    bail!(
                        "Worker '{}' is already registered by set '{}'",
                        worker.name(),
                        other_name
                    );
                }
            }
        }
        self.sets.insert(set.name().to_string(), set);
        Ok(())
    }

    /// Remove a worker set. Returns false if no such set was registered.
    /// In-flight tasks of its workers are unaffected.
    pub fn remove_set(&mut self, name: &str) -> bool {
        self.sets.remove(name).is_some()
    }

    pub fn get(&self, worker_name: &str) -> Option<Arc<dyn Worker>> {
        self.sets
            .values()
            .flat_map(|set| set.workers())
            .find(|w| w.name() == worker_name)
            .map(Arc::clone)
    }

    pub fn contains(&self, worker_name: &str) -> bool {
        self.get(worker_name).is_some()
    }

    /// List all registered workers, sorted by set then worker name.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .sets
            .values()
            .flat_map(|set| {
                set.workers().iter().map(|w| WorkerInfo {
                    set: set.name().to_string(),
                    name: w.name().to_string(),
                    pool_size: w.pool_size(),
                })
            })
            .collect();
        infos.sort_by(|a, b| a.set.cmp(&b.set).then_with(|| a.name.cmp(&b.name)));
        infos
    }
}
