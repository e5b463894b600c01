use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pgsteward::control::{ControlClient, ControlRequest, ControlResponse};
use pgsteward::task_store::{SqliteTaskStore, TaskStore};
use pgsteward::worker_pool::{system_worker_set, WorkerContext, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli_style;
use cli_style::{get_styles, print_empty_list, print_error, print_success, print_table, print_warning};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Agent home directory; used to locate the control socket and, for
    /// commands that bypass the daemon, the task database.
    #[clap(long, value_parser = parse_path)]
    pub home: Option<PathBuf>,

    /// Path of the daemon's control socket. Defaults to <home>/control.sock.
    #[clap(long, value_parser = parse_path)]
    pub socket_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a task to the running daemon.
    Submit {
        /// Worker to run.
        worker_name: String,

        /// Worker options as a JSON object.
        #[clap(long, default_value = "{}")]
        options: String,

        /// When the task becomes due (RFC 3339). Defaults to now.
        #[clap(long)]
        start_at: Option<DateTime<Utc>>,

        /// Seconds between runs; 0 makes the task one-shot.
        #[clap(long, default_value_t = 0)]
        redo_interval: i64,

        /// Seconds a finished one-shot task is kept before purging.
        #[clap(long, default_value_t = 86400)]
        expire: i64,

        /// Explicit task id. Derived from the submission when omitted.
        #[clap(long)]
        id: Option<String>,
    },

    /// List all tasks known to the running daemon.
    List,

    /// Cancel a task. Running tasks are asked to abort.
    Cancel { id: String },

    /// List the workers compiled into this binary.
    ListWorkers,

    /// Run a worker in the foreground, bypassing the daemon.
    RunWorker {
        /// Worker to run.
        worker_name: String,

        /// Worker options as a JSON object.
        #[clap(long, default_value = "{}")]
        options: String,
    },

    /// Delete every task from the store. The daemon must not be running.
    Flush,
}

impl CliArgs {
    fn socket_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }
        match &self.home {
            Some(home) => Ok(home.join("control.sock")),
            None => bail!("either --socket-path or --home is required"),
        }
    }

    fn task_db_path(&self) -> Result<PathBuf> {
        match &self.home {
            Some(home) => Ok(home.join("tasks.db")),
            None => bail!("--home is required for this command"),
        }
    }
}

fn parse_options(options: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str(options).context("options must be a JSON object")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    match &cli_args.command {
        Command::Submit {
            worker_name,
            options,
            start_at,
            redo_interval,
            expire,
            id,
        } => {
            let request = ControlRequest::TaskNew {
                worker_name: worker_name.clone(),
                options: parse_options(options)?,
                start_at: *start_at,
                redo_interval: *redo_interval,
                expire: *expire,
                id: id.clone(),
            };
            match send_request(&cli_args, &request).await? {
                ControlResponse::Accepted { id } => print_success(&format!("Task {} accepted", id)),
                ControlResponse::Conflict { id } => {
                    print_warning(&format!("Task {} is already scheduled", id))
                }
                other => print_unexpected(other),
            }
        }

        Command::List => match send_request(&cli_args, &ControlRequest::TaskList).await? {
            ControlResponse::Tasks { tasks } => {
                if tasks.is_empty() {
                    print_empty_list("No tasks");
                    return Ok(());
                }
                let rows: Vec<Vec<String>> = tasks
                    .iter()
                    .map(|t| {
                        vec![
                            t.id.clone(),
                            t.worker_name.clone(),
                            t.status.clone(),
                            t.start_at.clone(),
                            t.stop_at.clone().unwrap_or_default(),
                            if t.redo_interval > 0 {
                                format!("{}s", t.redo_interval)
                            } else {
                                String::new()
                            },
                        ]
                    })
                    .collect();
                print_table(
                    &["ID", "WORKER", "STATUS", "START AT", "STOP AT", "REDO"],
                    &rows,
                );
            }
            other => print_unexpected(other),
        },

        Command::Cancel { id } => {
            let request = ControlRequest::TaskCancel { id: id.clone() };
            match send_request(&cli_args, &request).await? {
                ControlResponse::Canceled { id } => print_success(&format!("Task {} canceled", id)),
                ControlResponse::NotFound { id } => {
                    print_error(&format!("No task with id {}", id));
                    std::process::exit(1);
                }
                ControlResponse::AlreadyFinished { id } => {
                    print_warning(&format!("Task {} already finished", id));
                    std::process::exit(1);
                }
                other => print_unexpected(other),
            }
        }

        Command::ListWorkers => {
            let registry = local_registry()?;
            let infos = registry.list();
            if infos.is_empty() {
                print_empty_list("No workers");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = infos
                .iter()
                .map(|i| vec![i.set.clone(), i.name.clone(), i.pool_size.to_string()])
                .collect();
            print_table(&["SET", "WORKER", "POOL SIZE"], &rows);
        }

        Command::RunWorker {
            worker_name,
            options,
        } => {
            let options = parse_options(options)?;
            let registry = local_registry()?;
            let worker = registry
                .get(worker_name)
                .with_context(|| format!("No worker named '{}'", worker_name))?;

            let task_store: Arc<dyn TaskStore> =
                Arc::new(SqliteTaskStore::new(cli_args.task_db_path()?)?);
            let ctx = WorkerContext::new(CancellationToken::new(), task_store);

            let output = tokio::task::spawn_blocking(move || worker.execute(&ctx, &options))
                .await
                .context("worker thread panicked")?;
            match output {
                Ok(output) => {
                    print_success("Worker finished");
                    println!("{}", output);
                }
                Err(e) => {
                    print_error(&format!("Worker failed: {}", e));
                    std::process::exit(1);
                }
            }
        }

        Command::Flush => {
            let task_store = SqliteTaskStore::new(cli_args.task_db_path()?)?;
            let count = task_store.flush()?;
            print_success(&format!("Deleted {} tasks", count));
        }
    }

    Ok(())
}

async fn send_request(cli_args: &CliArgs, request: &ControlRequest) -> Result<ControlResponse> {
    let socket_path = cli_args.socket_path()?;
    let mut client = ControlClient::connect(&socket_path).await?;
    client.send(request).await
}

fn local_registry() -> Result<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();
    registry.add_set(system_worker_set())?;
    Ok(registry)
}

fn print_unexpected(response: ControlResponse) {
    match response {
        ControlResponse::Error { message } => print_error(&message),
        other => print_error(&format!("Unexpected response: {:?}", other)),
    }
    std::process::exit(1);
}
