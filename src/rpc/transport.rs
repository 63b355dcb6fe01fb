//! The transport seam between engine and worker.

use crate::error::CoreError;
use crate::rpc::Endpoint;
use crate::types::ThreadId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A failure as the worker reports it: message plus its own stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    #[serde(rename = "error")]
    pub message: String,
    #[serde(rename = "errorTrace", default)]
    pub trace: Vec<String>,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl From<RemoteFailure> for CoreError {
    fn from(f: RemoteFailure) -> Self {
        CoreError::Remote {
            message: f.message,
            trace: f.trace,
        }
    }
}

/// Out-of-band message from the worker, delivered outside any call's
/// request/response cycle.
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    /// Progress of whatever the worker currently runs. Not tied to a
    /// thread id; decorates the overlay if one is shown.
    Progress {
        fraction: f64,
        message: Option<String>,
    },
    /// A threaded call finished with data.
    Completed { thread_id: ThreadId, data: Value },
    /// A threaded call failed.
    Failed {
        thread_id: ThreadId,
        failure: RemoteFailure,
    },
}

/// One round trip to the worker. For threaded endpoints this returns only
/// the acknowledgement; the result arrives later as a [`WorkerSignal`].
///
/// Implementations wrap the actual wire (websocket, child process, mock).
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn call(
        &self,
        endpoint: Endpoint,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteFailure>;
}
