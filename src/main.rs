use anyhow::{Context, Result};
use clap::Parser;
use pgsteward::config::{AppConfig, CliConfig, FileConfig};
use pgsteward::control::run_control_server;
use pgsteward::scheduler::{create_scheduler, SchedulerError, SchedulerHandle, TaskSpec};
use pgsteward::task_store::{SqliteTaskStore, TaskStore};
use pgsteward::worker_pool::{
    create_worker_pool, system_worker_set, WorkerRegistry, HOST_METRICS_WORKER,
    SYSTEM_WORKER_SET, TASK_STORE_VACUUM_WORKER,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the task database and control socket. Must exist.
    #[clap(long, value_parser = parse_path)]
    pub home: Option<PathBuf>,

    /// Path of the control socket. Defaults to <home>/control.sock.
    #[clap(long, value_parser = parse_path)]
    pub socket_path: Option<PathBuf>,

    /// Seconds between due-task polls.
    #[clap(long, default_value_t = 1)]
    pub poll_interval_secs: u64,

    /// Seconds between purges of expired finished tasks.
    #[clap(long, default_value_t = 60)]
    pub purge_interval_secs: u64,

    /// Seconds between host metrics samples. Set to 0 to disable.
    #[clap(long, default_value_t = 300)]
    pub metrics_interval_secs: i64,

    /// Seconds between task database compactions. Set to 0 to disable.
    #[clap(long, default_value_t = 86400)]
    pub vacuum_interval_secs: i64,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            home: self.home.clone(),
            socket_path: self.socket_path.clone(),
            poll_interval_secs: self.poll_interval_secs,
            purge_interval_secs: self.purge_interval_secs,
            metrics_interval_secs: self.metrics_interval_secs,
            vacuum_interval_secs: self.vacuum_interval_secs,
        }
    }
}

/// Owns the running components of the daemon: the worker registry for
/// reloads, the shutdown token, and the join handles awaited on exit.
struct Supervisor {
    registry: Arc<RwLock<WorkerRegistry>>,
    shutdown_token: CancellationToken,
    scheduler_join: JoinHandle<()>,
    pool_join: JoinHandle<()>,
    control_join: JoinHandle<()>,
}

impl Supervisor {
    fn start(config: &AppConfig, task_store: Arc<dyn TaskStore>) -> Result<(Self, SchedulerHandle)> {
        let mut registry = WorkerRegistry::new();
        registry.add_set(system_worker_set())?;
        let registry = Arc::new(RwLock::new(registry));

        let shutdown_token = CancellationToken::new();

        let (pool, pool_handle, event_rx) = create_worker_pool(
            Arc::clone(&registry),
            Arc::clone(&task_store),
            shutdown_token.clone(),
        );
        let (mut scheduler, scheduler_handle) = create_scheduler(
            task_store,
            Arc::clone(&registry),
            pool_handle,
            event_rx,
            shutdown_token.clone(),
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_secs(config.purge_interval_secs),
        );

        let pool_join = tokio::spawn(pool.run());
        let scheduler_join = tokio::spawn(async move { scheduler.run().await });
        let control_join = run_control_server(
            &config.socket_path,
            scheduler_handle.clone(),
            shutdown_token.clone(),
        )?;

        Ok((
            Self {
                registry,
                shutdown_token,
                scheduler_join,
                pool_join,
                control_join,
            },
            scheduler_handle,
        ))
    }

    /// Block on signals until shutdown is requested, then wait for the
    /// components to finish their drain.
    async fn run_until_shutdown(self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    self.shutdown_token.cancel();
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    self.shutdown_token.cancel();
                    break;
                }
                _ = sighup.recv() => {
                    // Swap the built-in set out and back in; in-flight tasks
                    // keep the workers they already hold
                    let mut registry = self.registry.write().await;
                    registry.remove_set(SYSTEM_WORKER_SET);
                    match registry.add_set(system_worker_set()) {
                        Ok(()) => info!(
                            "Received SIGHUP, reloaded {} workers",
                            registry.list().len()
                        ),
                        Err(e) => error!("Worker reload failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    // The scheduler trips the token itself when the store
                    // keeps failing
                    warn!("Internal shutdown requested");
                    break;
                }
            }
        }

        // Give the scheduler time to drain in-flight tasks
        let components = async {
            if let Err(e) = self.scheduler_join.await {
                error!("Scheduler task failed: {}", e);
            }
            if let Err(e) = self.pool_join.await {
                error!("Worker pool task failed: {}", e);
            }
            if let Err(e) = self.control_join.await {
                error!("Control server task failed: {}", e);
            }
        };
        if tokio::time::timeout(Duration::from_secs(60), components)
            .await
            .is_err()
        {
            error!("Components did not stop in time, exiting anyway");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Opening task database at {:?}...", config.task_db_path());
    let task_store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(config.task_db_path())?);

    let (supervisor, scheduler_handle) = Supervisor::start(&config, task_store)?;
    info!("Ready, control socket at {:?}", config.socket_path);

    bootstrap_builtin_tasks(&scheduler_handle, &config).await;

    supervisor.run_until_shutdown().await?;
    info!("Bye");
    Ok(())
}

/// Submit the built-in periodic tasks. Their ids are derived from worker
/// name and options, so on restart the submission lands on the task already
/// in the store and is reported as a conflict.
async fn bootstrap_builtin_tasks(handle: &SchedulerHandle, config: &AppConfig) {
    let builtins = [
        (HOST_METRICS_WORKER, config.metrics_interval_secs),
        (TASK_STORE_VACUUM_WORKER, config.vacuum_interval_secs),
    ];
    for (worker_name, interval_secs) in builtins {
        if interval_secs == 0 {
            info!("Built-in task '{}' disabled", worker_name);
            continue;
        }
        let spec = TaskSpec {
            worker_name: worker_name.to_string(),
            options: serde_json::Map::new(),
            start_at: None,
            redo_interval: interval_secs,
            expire: 0,
            id: None,
        };
        match handle.schedule(spec).await {
            Ok(id) => info!(
                "Built-in task '{}' scheduled as {} every {}s",
                worker_name, id, interval_secs
            ),
            Err(SchedulerError::AlreadyScheduled(id)) => {
                debug!("Built-in task '{}' already present as {}", worker_name, id);
            }
            Err(e) => {
                error!("Failed to schedule built-in task '{}': {}", worker_name, e);
            }
        }
    }
}
