//! Local control channel over a Unix domain socket.
//!
//! The daemon listens on a socket in its home directory; the operator CLI
//! connects and exchanges one JSON document per line. Each request line gets
//! exactly one response line.

mod client;
mod server;

pub use client::ControlClient;
pub use server::{run_control_server, ControlServer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task_store::TaskSummary;

fn default_expire() -> i64 {
    // Keep finished one-shot tasks around for a day unless told otherwise
    86400
}

/// A request line on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlRequest {
    TaskNew {
        worker_name: String,
        #[serde(default)]
        options: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        start_at: Option<DateTime<Utc>>,
        #[serde(default)]
        redo_interval: i64,
        #[serde(default = "default_expire")]
        expire: i64,
        #[serde(default)]
        id: Option<String>,
    },
    TaskList,
    TaskCancel {
        id: String,
    },
}

/// A response line on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Accepted { id: String },
    Conflict { id: String },
    Tasks { tasks: Vec<TaskSummary> },
    Canceled { id: String },
    NotFound { id: String },
    /// The task already reached a terminal status, so there is nothing left
    /// to cancel.
    AlreadyFinished { id: String },
    Error { message: String },
}
