//! The bridge that turns worker calls into awaitable results.
//!
//! Non-threaded endpoints are a plain round trip. Threaded endpoints
//! register a oneshot under the call's thread id, fire the call, and
//! resolve when the worker's completion or failure signal arrives out of
//! band. Aborting drops the local registration; the worker's eventual
//! completion for an unknown thread id is ignored.

use crate::error::{CoreError, Result};
use crate::params::{wire_parameters, SettingMap};
use crate::pipeline::definition::{LoaderSpec, PipelineDefinition, StepDef};
use crate::rpc::transport::{RemoteFailure, WorkerSignal, WorkerTransport};
use crate::rpc::Endpoint;
use crate::store::{CellHandle, StateStore};
use crate::types::{FolderContents, LocalFile, OverlayState, ThreadId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

type PendingSender = oneshot::Sender<Result<Value>>;

pub struct RpcBridge {
    transport: Option<Arc<dyn WorkerTransport>>,
    pending: Mutex<HashMap<ThreadId, PendingSender>>,
    store: Arc<StateStore>,
    overlay: CellHandle<Option<OverlayState>>,
}

impl RpcBridge {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        store: Arc<StateStore>,
        overlay: CellHandle<Option<OverlayState>>,
    ) -> Self {
        Self {
            transport: Some(transport),
            pending: Mutex::new(HashMap::new()),
            store,
            overlay,
        }
    }

    /// A bridge with no worker behind it. Every call fails with
    /// [`CoreError::BridgeUnavailable`].
    pub fn disconnected(store: Arc<StateStore>, overlay: CellHandle<Option<OverlayState>>) -> Self {
        Self {
            transport: None,
            pending: Mutex::new(HashMap::new()),
            store,
            overlay,
        }
    }

    fn transport(&self) -> Result<&Arc<dyn WorkerTransport>> {
        self.transport.as_ref().ok_or(CoreError::BridgeUnavailable)
    }

    /// Fire-and-resolve call for non-threaded endpoints.
    pub async fn call(&self, endpoint: Endpoint, args: Vec<Value>) -> Result<Value> {
        tracing::debug!(%endpoint, "worker call");
        self.transport()?
            .call(endpoint, args)
            .await
            .map_err(CoreError::from)
    }

    /// Threaded call: resolves when the worker signals completion for
    /// `thread_id`. A second call on the same thread id stomps the first,
    /// which then fails with a channel error.
    pub async fn call_threaded(
        &self,
        thread_id: &str,
        endpoint: Endpoint,
        mut args: Vec<Value>,
    ) -> Result<Value> {
        let transport = Arc::clone(self.transport()?);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.insert(thread_id.to_string(), tx).is_some() {
                tracing::warn!(thread_id, "stomping pending call on same thread id");
            }
        }

        args.insert(0, Value::from(thread_id));
        tracing::debug!(%endpoint, thread_id, "threaded worker call");
        if let Err(failure) = transport.call(endpoint, args).await {
            self.take_pending(thread_id);
            return Err(failure.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Channel(format!(
                "call on thread '{thread_id}' was superseded"
            ))),
        }
    }

    fn take_pending(&self, thread_id: &str) -> Option<PendingSender> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id)
    }

    /// Cancels the pending call on `thread_id` locally and notifies the
    /// worker. The worker may keep computing; its late completion is
    /// dropped. Returns whether a call was actually pending.
    pub async fn abort(&self, thread_id: &str) -> bool {
        let Some(tx) = self.take_pending(thread_id) else {
            return false;
        };
        let _ = tx.send(Err(CoreError::Aborted));
        tracing::debug!(thread_id, "aborted pending call");
        if let Ok(transport) = self.transport() {
            if let Err(f) = transport
                .call(Endpoint::AbortStep, vec![Value::from(thread_id)])
                .await
            {
                tracing::warn!(thread_id, error = %f.message, "abort notification failed");
            }
        }
        true
    }

    /// Handles one out-of-band signal from the worker.
    pub fn handle_signal(&self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Progress { fraction, message } => {
                if let Some(mut overlay) = self.store.get(&self.overlay) {
                    if let Some(msg) = message {
                        overlay.message = msg;
                    }
                    overlay.progress = (fraction > 0.0).then_some(fraction.min(1.0));
                    self.store.set(&self.overlay, Some(overlay));
                }
                // no overlay shown: progress is dropped
            }
            WorkerSignal::Completed { thread_id, data } => {
                match self.take_pending(&thread_id) {
                    Some(tx) => {
                        let _ = tx.send(Ok(data));
                    }
                    None => {
                        tracing::debug!(thread_id, "completion for unknown thread id, dropping")
                    }
                }
            }
            WorkerSignal::Failed { thread_id, failure } => {
                match self.take_pending(&thread_id) {
                    Some(tx) => {
                        let _ = tx.send(Err(failure.into()));
                    }
                    None => {
                        tracing::debug!(thread_id, "failure for unknown thread id, dropping")
                    }
                }
            }
        }
    }

    /// Spawns a task that feeds every signal from `rx` into
    /// [`handle_signal`](Self::handle_signal).
    pub fn spawn_signal_pump(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WorkerSignal>,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                bridge.handle_signal(signal);
            }
        })
    }
}

// Typed endpoint wrappers. These own the argument shapes of the wire
// protocol so callers never build raw JSON.
impl RpcBridge {
    /// Runs a step on its own worker thread; the step's module id doubles
    /// as the thread id so each step has at most one call in flight.
    pub async fn run_step(&self, step: &StepDef, settings: &SettingMap) -> Result<Value> {
        let args = step_args(step, settings);
        self.call_threaded(&step.module_id, Endpoint::RunStepAsync, args)
            .await
    }

    /// Runs a step inside the request itself. Used by hosts that manage
    /// their own concurrency.
    pub async fn run_step_blocking(&self, step: &StepDef, settings: &SettingMap) -> Result<Value> {
        self.call(Endpoint::RunStepBlocking, step_args(step, settings))
            .await
    }

    /// Loads one input file through the given loader. `preview_index`
    /// disambiguates progress reporting when several files load at once.
    pub async fn load_input_file(
        &self,
        key: &str,
        path: &str,
        loader: &LoaderSpec,
        preview_index: i64,
    ) -> Result<Value> {
        self.call(
            Endpoint::LoadInputFile,
            vec![
                Value::from(key),
                Value::from(path),
                Value::from(loader.loader_id.clone()),
                loader.params.clone(),
                Value::from(preview_index),
            ],
        )
        .await
    }

    pub async fn folder_contents(
        &self,
        path: &str,
        extensions: Option<&[String]>,
    ) -> Result<FolderContents> {
        let ext = match extensions {
            Some(e) => serde_json::to_value(e)?,
            None => Value::Null,
        };
        let raw = self
            .call(Endpoint::ListFolder, vec![Value::from(path), ext])
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Resolves glob patterns, one per pipeline input, into batch rows.
    /// Row `i` holds the i-th file of each pattern, or `None` where a
    /// pattern matched fewer files. `extension_sets` carries, per pattern,
    /// the extensions that input's loaders accept (see
    /// [`PipelineDefinition::input_extension_sets`]).
    pub async fn batch_globs(
        &self,
        patterns: &[String],
        extension_sets: &[Vec<String>],
    ) -> Result<Vec<Vec<Option<LocalFile>>>> {
        let raw = self
            .call(
                Endpoint::LoadBatchGlobs,
                vec![
                    serde_json::to_value(patterns)?,
                    serde_json::to_value(extension_sets)?,
                ],
            )
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Announces a freshly loaded pipeline so the worker can reset its
    /// session state and learn each step's static settings.
    pub async fn pipeline_loaded(&self, definition: &PipelineDefinition) -> Result<Value> {
        let step_settings: serde_json::Map<String, Value> = definition
            .steps
            .iter()
            .map(|s| (s.module_id.clone(), s.server_params.clone()))
            .collect();
        self.call(
            Endpoint::ResetPipeline,
            vec![Value::from(definition.name.clone()), Value::Object(step_settings)],
        )
        .await
    }

    /// Exports one data key of the current batch. `module_id` names the
    /// step that produced the key, so the worker can pick its exporter.
    pub async fn export_data(
        &self,
        module_id: &str,
        data_key: &str,
        destination: &str,
        overwrite: bool,
        exporter_params: &Value,
    ) -> Result<Value> {
        self.call(
            Endpoint::ExportData,
            vec![
                Value::from(module_id),
                Value::from(data_key),
                Value::from(destination),
                Value::from(overwrite),
                exporter_params.clone(),
            ],
        )
        .await
    }

    pub async fn export_aggregate(
        &self,
        aggregator_id: &str,
        destination: &str,
        batch_key: &str,
        exporter_params: &Value,
    ) -> Result<Value> {
        self.call(
            Endpoint::ExportAggregate,
            vec![
                Value::from(aggregator_id),
                Value::from(destination),
                Value::from(batch_key),
                exporter_params.clone(),
            ],
        )
        .await
    }

    pub async fn aggregate_info(&self, aggregator_id: &str, destination: &str) -> Result<Value> {
        self.call(
            Endpoint::GetAggregateInfo,
            vec![Value::from(aggregator_id), Value::from(destination)],
        )
        .await
    }

    pub async fn reset_aggregate(
        &self,
        aggregator_id: &str,
        destination: &str,
        batch_key: Option<&str>,
    ) -> Result<Value> {
        self.call(
            Endpoint::ResetAggregate,
            vec![
                Value::from(aggregator_id),
                Value::from(destination),
                batch_key.map(Value::from).unwrap_or(Value::Null),
            ],
        )
        .await
    }
}

fn step_args(step: &StepDef, settings: &SettingMap) -> Vec<Value> {
    let params = wire_parameters(&step.parameters, settings);
    let inputs: Vec<&String> = step.input_keys.values().collect();
    let outputs: Vec<&String> = step.output_keys.values().collect();
    vec![
        Value::from(step.module_id.clone()),
        Value::from(step.action.clone()),
        json!(params),
        json!(inputs),
        json!(outputs),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{MockOutcome, MockWorker};

    fn harness() -> (
        Arc<RpcBridge>,
        Arc<MockWorker>,
        tokio::task::JoinHandle<()>,
        Arc<StateStore>,
        CellHandle<Option<OverlayState>>,
    ) {
        let store = Arc::new(StateStore::new());
        let overlay = store.declare("overlay", None::<OverlayState>);
        let (worker, signal_rx) = MockWorker::new();
        let bridge = Arc::new(RpcBridge::new(
            worker.clone() as Arc<dyn WorkerTransport>,
            Arc::clone(&store),
            overlay.clone(),
        ));
        let pump = bridge.spawn_signal_pump(signal_rx);
        (bridge, worker, pump, store, overlay)
    }

    #[tokio::test]
    async fn test_disconnected_bridge_fails_fast() {
        let store = Arc::new(StateStore::new());
        let overlay = store.declare("overlay", None::<OverlayState>);
        let bridge = RpcBridge::disconnected(store, overlay);
        let err = bridge.call(Endpoint::ListFolder, vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::BridgeUnavailable));
    }

    #[tokio::test]
    async fn test_threaded_call_resolves_via_signal() {
        let (bridge, worker, _pump, _store, _overlay) = harness();
        worker.script(
            Endpoint::RunStepAsync,
            MockOutcome::Ok(json!({"out": [1, 2]})),
        );
        let result = bridge
            .call_threaded("mod1", Endpoint::RunStepAsync, vec![])
            .await
            .unwrap();
        assert_eq!(result, json!({"out": [1, 2]}));
    }

    #[tokio::test]
    async fn test_threaded_failure_carries_trace() {
        let (bridge, worker, _pump, _store, _overlay) = harness();
        let mut failure = RemoteFailure::new("bad input");
        failure.trace = vec!["mod.py:3".into()];
        worker.script(Endpoint::RunStepAsync, MockOutcome::Err(failure));
        let err = bridge
            .call_threaded("mod1", Endpoint::RunStepAsync, vec![])
            .await
            .unwrap_err();
        match err {
            CoreError::Remote { message, trace } => {
                assert_eq!(message, "bad input");
                assert_eq!(trace, vec!["mod.py:3".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_abort_rejects_locally_and_drops_late_completion() {
        let (bridge, worker, _pump, _store, _overlay) = harness();
        worker.script(Endpoint::RunStepAsync, MockOutcome::Silent);

        let b = Arc::clone(&bridge);
        let call = tokio::spawn(async move {
            b.call_threaded("mod1", Endpoint::RunStepAsync, vec![]).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(bridge.abort("mod1").await);
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(worker.calls_to(Endpoint::AbortStep), 1);

        // a completion arriving after the abort is a silent no-op
        bridge.handle_signal(WorkerSignal::Completed {
            thread_id: "mod1".into(),
            data: json!(null),
        });
        assert!(!bridge.abort("mod1").await);
    }

    #[tokio::test]
    async fn test_export_data_wire_shape() {
        let (bridge, worker, _pump, _store, _overlay) = harness();
        bridge
            .export_data("counter", "counts", "/out/c.xlsx", true, &json!({"sheet": "cells"}))
            .await
            .unwrap();

        let calls = worker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, Endpoint::ExportData);
        assert_eq!(
            calls[0].args,
            vec![
                json!("counter"),
                json!("counts"),
                json!("/out/c.xlsx"),
                json!(true),
                json!({"sheet": "cells"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_globs_wire_shape() {
        let (bridge, worker, _pump, _store, _overlay) = harness();
        worker.script(Endpoint::LoadBatchGlobs, MockOutcome::Ok(json!([])));
        bridge
            .batch_globs(
                &["/data/*_img.png".to_string()],
                &[vec!["png".to_string(), "tif".to_string()]],
            )
            .await
            .unwrap();

        let calls = worker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].args,
            vec![json!(["/data/*_img.png"]), json!([["png", "tif"]])]
        );
    }

    #[tokio::test]
    async fn test_progress_decorates_existing_overlay_only() {
        let (bridge, _worker, _pump, store, overlay) = harness();

        // without an overlay the signal is dropped
        bridge.handle_signal(WorkerSignal::Progress {
            fraction: 0.5,
            message: None,
        });
        assert_eq!(store.get(&overlay), None);

        store.set(&overlay, Some(OverlayState::new("Running")));
        bridge.handle_signal(WorkerSignal::Progress {
            fraction: 0.5,
            message: Some("halfway".into()),
        });
        let ov = store.get(&overlay).unwrap();
        assert_eq!(ov.message, "halfway");
        assert_eq!(ov.progress, Some(0.5));

        // fraction 0 reverts to indeterminate
        bridge.handle_signal(WorkerSignal::Progress {
            fraction: 0.0,
            message: None,
        });
        assert_eq!(store.get(&overlay).unwrap().progress, None);
    }
}
