mod pool;
mod registry;
mod workers;

pub use pool::{create_worker_pool, PoolHandle, TaskEvent, WorkerPool};
pub use registry::{Worker, WorkerContext, WorkerError, WorkerInfo, WorkerRegistry, WorkerSet};
pub use workers::{
    system_worker_set, HostMetricsWorker, TaskStoreVacuumWorker, HOST_METRICS_WORKER,
    SYSTEM_WORKER_SET, TASK_STORE_VACUUM_WORKER,
};
