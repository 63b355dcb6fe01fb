//! Worker RPC: transport seam, the promise-keeping bridge and typed
//! endpoint wrappers.

mod bridge;
pub mod mock;
mod transport;

pub use bridge::RpcBridge;
pub use transport::{RemoteFailure, WorkerSignal, WorkerTransport};

/// The endpoints the worker exposes. The wire name is what goes over the
/// transport; the worker dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    RunStepBlocking,
    RunStepAsync,
    AbortStep,
    LoadInputFile,
    ListFolder,
    LoadBatchGlobs,
    ResetPipeline,
    ExportData,
    ExportAggregate,
    GetAggregateInfo,
    ResetAggregate,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::RunStepBlocking => "run-step-blocking",
            Endpoint::RunStepAsync => "run-step-async",
            Endpoint::AbortStep => "abort-step",
            Endpoint::LoadInputFile => "load-input-file",
            Endpoint::ListFolder => "list-folder",
            Endpoint::LoadBatchGlobs => "load-batch-globs",
            Endpoint::ResetPipeline => "reset-pipeline",
            Endpoint::ExportData => "export-data",
            Endpoint::ExportAggregate => "export-aggregate",
            Endpoint::GetAggregateInfo => "get-aggregate-info",
            Endpoint::ResetAggregate => "reset-aggregate",
        }
    }

    /// Threaded endpoints resolve through an out-of-band completion signal
    /// instead of the call's own return value.
    pub fn is_threaded(&self) -> bool {
        matches!(self, Endpoint::RunStepAsync)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
