use super::{ControlRequest, ControlResponse};
use crate::scheduler::{SchedulerError, SchedulerHandle, TaskSpec};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts connections on the control socket and forwards requests to the
/// scheduler. One task per connection; a connection can send any number of
/// request lines.
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    scheduler: SchedulerHandle,
    shutdown_token: CancellationToken,
}

impl ControlServer {
    pub fn bind<P: AsRef<Path>>(
        socket_path: P,
        scheduler: SchedulerHandle,
        shutdown_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        // A previous run that wasn't shut down cleanly leaves the socket file
        // behind; binding over it fails, so remove it first
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Removing stale socket {:?}", socket_path))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Binding control socket {:?}", socket_path))?;
        Ok(Self {
            listener,
            socket_path,
            scheduler,
            shutdown_token,
        })
    }

    pub async fn run(self) {
        info!("Control channel listening on {:?}", self.socket_path);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let scheduler = self.scheduler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, scheduler).await {
                                    debug!("Control connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept control connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    break;
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove control socket: {}", e);
        }
        info!("Control channel stopped");
    }
}

/// Bind and run a control server, returning its join handle.
pub fn run_control_server<P: AsRef<Path>>(
    socket_path: P,
    scheduler: SchedulerHandle,
    shutdown_token: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let server = ControlServer::bind(socket_path, scheduler, shutdown_token)?;
    Ok(tokio::spawn(server.run()))
}

async fn serve_connection(stream: UnixStream, scheduler: SchedulerHandle) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handle_request(request, &scheduler).await,
            Err(e) => ControlResponse::Error {
                message: format!("invalid request: {}", e),
            },
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_request(request: ControlRequest, scheduler: &SchedulerHandle) -> ControlResponse {
    match request {
        ControlRequest::TaskNew {
            worker_name,
            options,
            start_at,
            redo_interval,
            expire,
            id,
        } => {
            let spec = TaskSpec {
                worker_name,
                options,
                start_at,
                redo_interval,
                expire,
                id,
            };
            match scheduler.schedule(spec).await {
                Ok(id) => ControlResponse::Accepted { id },
                Err(SchedulerError::AlreadyScheduled(id)) => ControlResponse::Conflict { id },
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        ControlRequest::TaskList => match scheduler.list().await {
            Ok(tasks) => ControlResponse::Tasks { tasks },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlRequest::TaskCancel { id } => match scheduler.cancel(&id).await {
            Ok(()) => ControlResponse::Canceled { id },
            Err(SchedulerError::NotFound(id)) => ControlResponse::NotFound { id },
            Err(SchedulerError::AlreadyFinished(id)) => ControlResponse::AlreadyFinished { id },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
    }
}
