use super::{ControlRequest, ControlResponse};
use anyhow::{bail, Context};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Client side of the control socket, used by the operator CLI.
pub struct ControlClient {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Connecting to control socket {:?}", socket_path))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            write_half,
        })
    }

    /// Send one request and wait for its response line.
    pub async fn send(&mut self, request: &ControlRequest) -> anyhow::Result<ControlResponse> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.write_half.write_all(line.as_bytes()).await?;

        match self.lines.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)
                .with_context(|| format!("Parsing control response: {}", line))?),
            None => bail!("control socket closed before responding"),
        }
    }
}
