//! Built-in workers shipped with the agent, grouped in the "system" set.

use super::registry::{Worker, WorkerContext, WorkerError, WorkerSet};
use std::sync::Arc;
use tracing::debug;

pub const SYSTEM_WORKER_SET: &str = "system";
pub const TASK_STORE_VACUUM_WORKER: &str = "task_store_vacuum";
pub const HOST_METRICS_WORKER: &str = "host_metrics";

/// The built-in worker set, registered at daemon startup and re-registered
/// on reload.
pub fn system_worker_set() -> WorkerSet {
    let mut set = WorkerSet::new(SYSTEM_WORKER_SET);
    set.add(Arc::new(TaskStoreVacuumWorker));
    set.add(Arc::new(HostMetricsWorker));
    set
}

/// Compacts the agent's own task database.
pub struct TaskStoreVacuumWorker;

impl Worker for TaskStoreVacuumWorker {
    fn name(&self) -> &'static str {
        TASK_STORE_VACUUM_WORKER
    }

    fn execute(
        &self,
        ctx: &WorkerContext,
        _options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, WorkerError> {
        if ctx.is_cancelled() {
            return Err(WorkerError::Aborted);
        }
        ctx.task_store
            .vacuum()
            .map_err(|e| WorkerError::Failed(format!("vacuum failed: {}", e)))?;
        debug!("Task store vacuum completed");
        Ok("task store compacted".to_string())
    }
}

/// Samples host load and memory from procfs and reports them as a JSON
/// snapshot in the task output.
pub struct HostMetricsWorker;

impl Worker for HostMetricsWorker {
    fn name(&self) -> &'static str {
        HOST_METRICS_WORKER
    }

    fn execute(
        &self,
        ctx: &WorkerContext,
        _options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, WorkerError> {
        if ctx.is_cancelled() {
            return Err(WorkerError::Aborted);
        }

        let loadavg = std::fs::read_to_string("/proc/loadavg")
            .map_err(|e| WorkerError::Failed(format!("reading /proc/loadavg: {}", e)))?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| WorkerError::Failed(format!("reading /proc/meminfo: {}", e)))?;

        let (load1, load5, load15) = parse_loadavg(&loadavg)
            .ok_or_else(|| WorkerError::Failed("unexpected /proc/loadavg format".to_string()))?;
        let mem_total_kb = parse_meminfo_field(&meminfo, "MemTotal");
        let mem_available_kb = parse_meminfo_field(&meminfo, "MemAvailable");

        let snapshot = serde_json::json!({
            "load1": load1,
            "load5": load5,
            "load15": load15,
            "mem_total_kb": mem_total_kb,
            "mem_available_kb": mem_available_kb,
        });
        Ok(snapshot.to_string())
    }
}

fn parse_loadavg(content: &str) -> Option<(f64, f64, f64)> {
    let mut parts = content.split_whitespace();
    let load1 = parts.next()?.parse().ok()?;
    let load5 = parts.next()?.parse().ok()?;
    let load15 = parts.next()?.parse().ok()?;
    Some((load1, load5, load15))
}

fn parse_meminfo_field(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}
