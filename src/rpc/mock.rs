//! A scriptable in-process worker for tests.
//!
//! Outcomes are queued per endpoint and consumed in order. Threaded
//! endpoints acknowledge immediately and deliver their queued outcome as an
//! out-of-band [`WorkerSignal`], exactly like a real worker would.

use crate::rpc::transport::{RemoteFailure, WorkerSignal, WorkerTransport};
use crate::rpc::Endpoint;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Ok(Value),
    Err(RemoteFailure),
    /// Acknowledge a threaded call but never signal completion. Used to
    /// test aborts.
    Silent,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: Endpoint,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct MockInner {
    scripts: HashMap<Endpoint, VecDeque<MockOutcome>>,
    calls: Vec<RecordedCall>,
}

pub struct MockWorker {
    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    inner: Mutex<MockInner>,
}

impl MockWorker {
    /// Creates the worker and the signal channel a bridge pump consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                signal_tx,
                inner: Mutex::new(MockInner::default()),
            }),
            signal_rx,
        )
    }

    /// Queues the next outcome for `endpoint`. Unscripted calls succeed
    /// with `null`.
    pub fn script(&self, endpoint: Endpoint, outcome: MockOutcome) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scripts
            .entry(endpoint)
            .or_default()
            .push_back(outcome);
    }

    /// Emits a raw signal, for tests that exercise signal handling
    /// directly.
    pub fn send_signal(&self, signal: WorkerSignal) {
        let _ = self.signal_tx.send(signal);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .clone()
    }

    pub fn calls_to(&self, endpoint: Endpoint) -> usize {
        self.calls().iter().filter(|c| c.endpoint == endpoint).count()
    }

    fn next_outcome(&self, endpoint: Endpoint, args: &[Value]) -> MockOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.calls.push(RecordedCall {
            endpoint,
            args: args.to_vec(),
        });
        inner
            .scripts
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front())
            .unwrap_or(MockOutcome::Ok(Value::Null))
    }
}

#[async_trait]
impl WorkerTransport for MockWorker {
    async fn call(
        &self,
        endpoint: Endpoint,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteFailure> {
        let outcome = self.next_outcome(endpoint, &args);
        if endpoint.is_threaded() {
            // the bridge prepends the thread id for threaded endpoints
            let thread_id = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match outcome {
                MockOutcome::Ok(data) => {
                    let _ = self.signal_tx.send(WorkerSignal::Completed { thread_id, data });
                }
                MockOutcome::Err(failure) => {
                    let _ = self
                        .signal_tx
                        .send(WorkerSignal::Failed { thread_id, failure });
                }
                MockOutcome::Silent => {}
            }
            Ok(Value::Null)
        } else {
            match outcome {
                MockOutcome::Ok(data) => Ok(data),
                MockOutcome::Err(failure) => Err(failure),
                MockOutcome::Silent => Ok(Value::Null),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_outcomes_consumed_in_order() {
        let (worker, _rx) = MockWorker::new();
        worker.script(Endpoint::ListFolder, MockOutcome::Ok(json!(["a"])));
        worker.script(Endpoint::ListFolder, MockOutcome::Err(RemoteFailure::new("gone")));

        assert_eq!(
            worker.call(Endpoint::ListFolder, vec![]).await.unwrap(),
            json!(["a"])
        );
        assert!(worker.call(Endpoint::ListFolder, vec![]).await.is_err());
        // queue exhausted, falls back to null
        assert_eq!(
            worker.call(Endpoint::ListFolder, vec![]).await.unwrap(),
            Value::Null
        );
        assert_eq!(worker.calls_to(Endpoint::ListFolder), 3);
    }

    #[tokio::test]
    async fn test_threaded_call_signals_instead_of_returning() {
        let (worker, mut rx) = MockWorker::new();
        worker.script(Endpoint::RunStepAsync, MockOutcome::Ok(json!(7)));
        let ack = worker
            .call(Endpoint::RunStepAsync, vec![json!("t1")])
            .await
            .unwrap();
        assert_eq!(ack, Value::Null);
        match rx.recv().await.unwrap() {
            WorkerSignal::Completed { thread_id, data } => {
                assert_eq!(thread_id, "t1");
                assert_eq!(data, json!(7));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}
