//! In-process event bus wiring the scheduler to step, export and aggregate
//! handlers without direct references.
//!
//! Listeners are keyed by `(id, kind)`: registering the same pair again
//! replaces the callback in place and keeps the original position, so a
//! handler that re-registers on every state change never piles up and never
//! loses its spot in the reply order. Replies come back in registration
//! order; a listener that needs to do async work returns a deferred reply
//! which [`EventBus::emit_await`] drives one at a time, preserving order.

use crate::types::{DataKey, ModuleId};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// The event kinds the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Parameters changed; payload says whether the change is relevant to
    /// the worker side.
    ParametersChanged,
    /// A transient user-facing notification.
    Toast,
    /// The scheduler asks the current step to run.
    RunStep,
    /// A step finished, successfully or not.
    StepCompleted,
    /// The scheduler asks export handlers to run for the current batch.
    RunExport,
    /// The scheduler asks aggregate handlers to run.
    RunAggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastSeverity {
    Info,
    Success,
    Error,
}

/// Result of one pipeline step run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub module_id: ModuleId,
    pub success: bool,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success(module_id: impl Into<ModuleId>) -> Self {
        Self {
            module_id: module_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(module_id: impl Into<ModuleId>, error: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Result of one per-batch export handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub output_key: DataKey,
    pub title: String,
    pub success: bool,
    pub destination: Option<String>,
    pub error: Option<String>,
}

/// Result of one aggregate handler.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub aggregator_id: String,
    pub title: String,
    pub success: bool,
    pub destination: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    None,
    /// `true` when the changed parameter matters to the worker side.
    ParametersChanged(bool),
    Toast {
        message: String,
        severity: ToastSeverity,
    },
    StepCompleted(StepOutcome),
}

/// What a listener resolved to. `None` for listeners that only observe.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResult {
    None,
    Step(StepOutcome),
    Export(ExportOutcome),
    Aggregate(AggregateOutcome),
}

/// A listener's reply: immediate, or a future the emitter awaits.
pub enum EventReply {
    Ready(EventResult),
    Deferred(BoxFuture<'static, EventResult>),
}

impl EventReply {
    pub fn none() -> Self {
        EventReply::Ready(EventResult::None)
    }

    pub fn ready(result: EventResult) -> Self {
        EventReply::Ready(result)
    }

    pub fn deferred(fut: BoxFuture<'static, EventResult>) -> Self {
        EventReply::Deferred(fut)
    }
}

type Listener = Arc<dyn Fn(EventPayload) -> EventReply + Send + Sync>;

struct Registration {
    id: String,
    kind: EventKind,
    listener: Listener,
}

/// Synchronous multi-listener event bus. Emission snapshots the listener
/// list, so a listener may register or remove listeners while handling an
/// event without affecting the emission in flight.
#[derive(Default)]
pub struct EventBus {
    registrations: Mutex<Vec<Registration>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `(id, kind)`. Re-registering replaces the
    /// callback in place.
    pub fn on<F>(&self, kind: EventKind, id: &str, listener: F)
    where
        F: Fn(EventPayload) -> EventReply + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut regs = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = regs.iter_mut().find(|r| r.id == id && r.kind == kind) {
            existing.listener = listener;
        } else {
            regs.push(Registration {
                id: id.to_string(),
                kind,
                listener,
            });
        }
    }

    /// Removes listeners registered under `id`, either for one kind or for
    /// all kinds. Unknown ids are a no-op.
    pub fn off(&self, id: &str, kind: Option<EventKind>) {
        let mut regs = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        regs.retain(|r| r.id != id || kind.is_some_and(|k| r.kind != k));
    }

    /// Emits an event to all listeners of its kind, in registration order.
    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> Vec<EventReply> {
        let listeners: Vec<Listener> = {
            let regs = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
            regs.iter()
                .filter(|r| r.kind == kind)
                .map(|r| Arc::clone(&r.listener))
                .collect()
        };
        listeners.iter().map(|l| l(payload.clone())).collect()
    }

    /// Emits and resolves every reply, awaiting deferred ones sequentially
    /// so results arrive in registration order.
    pub async fn emit_await(&self, kind: EventKind, payload: EventPayload) -> Vec<EventResult> {
        let replies = self.emit(kind, payload);
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            match reply {
                EventReply::Ready(r) => results.push(r),
                EventReply::Deferred(fut) => results.push(fut.await),
            }
        }
        results
    }

    pub fn toast(&self, message: impl Into<String>, severity: ToastSeverity) {
        self.emit(
            EventKind::Toast,
            EventPayload::Toast {
                message: message.into(),
                severity,
            },
        );
    }
}
