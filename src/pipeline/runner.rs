//! Runs the current pipeline step on the worker and commits its outputs.
//!
//! The runner listens on the bus rather than being called directly, so the
//! scheduler and any host UI trigger steps the same way. A step whose
//! server-relevant inputs and parameters match its previous successful run
//! reports success without touching the worker.

use crate::error::CoreError;
use crate::events::{EventBus, EventKind, EventPayload, EventReply, EventResult, StepOutcome};
use crate::params::{server_relevant_settings, SettingMap};
use crate::pipeline::data::update_pipeline_data;
use crate::pipeline::definition::StepDef;
use crate::pipeline::CoreContext;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

const LISTENER_ID: &str = "step-runner";

/// What a step last ran with. A batch switch changes the input values, so
/// the snapshot comparison covers batches implicitly.
#[derive(PartialEq)]
struct RunSnapshot {
    /// Logical input name -> data value present at run time.
    inputs: BTreeMap<String, Option<Value>>,
    /// Server-relevant parameter values.
    settings: SettingMap,
}

pub struct StepRunner {
    ctx: CoreContext,
    last_runs: Mutex<HashMap<String, RunSnapshot>>,
}

impl StepRunner {
    pub fn new(ctx: CoreContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            last_runs: Mutex::new(HashMap::new()),
        })
    }

    /// Registers this runner as the handler of step-run requests.
    pub fn attach(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        self.ctx.bus.on(EventKind::RunStep, LISTENER_ID, move |_| {
            let runner = Arc::clone(&runner);
            EventReply::deferred(Box::pin(async move {
                EventResult::Step(runner.run_current().await)
            }))
        });
    }

    pub fn detach(&self) {
        self.ctx.bus.off(LISTENER_ID, Some(EventKind::RunStep));
    }

    /// Forgets previous runs, forcing the next run of every step.
    pub fn reset(&self) {
        self.last_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Runs the step at the current step index and announces its
    /// completion on the bus.
    pub async fn run_current(&self) -> StepOutcome {
        let index = self.ctx.store.get(&self.ctx.cells.cur_step);
        let outcome = match self.ctx.definition.step(index) {
            Some(step) => self.run_step(index, step).await,
            None => StepOutcome::failure("", format!("no step at index {index}")),
        };
        self.ctx.bus.emit(
            EventKind::StepCompleted,
            EventPayload::StepCompleted(outcome.clone()),
        );
        outcome
    }

    async fn run_step(&self, index: usize, step: &StepDef) -> StepOutcome {
        let data = self.ctx.store.get(&self.ctx.cells.data);
        let missing: Vec<String> = step
            .input_keys
            .values()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return StepOutcome::failure(
                step.module_id.clone(),
                CoreError::MissingDependency(missing).to_string(),
            );
        }

        let settings = self
            .ctx
            .store
            .get(&self.ctx.cells.parameters)
            .get(index)
            .cloned()
            .unwrap_or_default();
        let snapshot = RunSnapshot {
            inputs: step
                .input_keys
                .iter()
                .map(|(name, key)| (name.clone(), data.get(key).cloned()))
                .collect(),
            settings: server_relevant_settings(&step.parameters, &settings),
        };
        let unchanged = {
            let mut last = self.last_runs.lock().unwrap_or_else(|e| e.into_inner());
            let unchanged = last.get(&step.module_id) == Some(&snapshot);
            last.insert(step.module_id.clone(), snapshot);
            unchanged
        };
        if unchanged {
            tracing::debug!(module = %step.module_id, "inputs unchanged, skipping worker run");
            return StepOutcome::success(step.module_id.clone());
        }

        tracing::info!(module = %step.module_id, "running step");
        match self.ctx.bridge.run_step(step, &settings).await {
            Ok(result) => {
                self.commit_outputs(step, result);
                StepOutcome::success(step.module_id.clone())
            }
            Err(e) => {
                // a failed run must not count as the last successful one
                self.last_runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&step.module_id);
                StepOutcome::failure(step.module_id.clone(), e.to_string())
            }
        }
    }

    /// Commits the worker's result, one value per logical output name.
    /// Each committed key invalidates its own downstream, so a changed
    /// output taints later steps while an identical one does not.
    fn commit_outputs(&self, step: &StepDef, result: Value) {
        let Value::Object(mut map) = result else {
            if !step.output_keys.is_empty() {
                tracing::warn!(module = %step.module_id, "worker result is not an object, outputs dropped");
            }
            return;
        };
        for (name, key) in &step.output_keys {
            match map.remove(name) {
                Some(value) => {
                    update_pipeline_data(
                        &self.ctx.store,
                        &self.ctx.cells.data,
                        &self.ctx.definition,
                        key,
                        Some(value),
                    );
                }
                None => {
                    tracing::warn!(module = %step.module_id, output = %name, "worker result misses declared output")
                }
            }
        }
        for extra in map.keys() {
            tracing::warn!(module = %step.module_id, output = %extra, "ignoring undeclared worker output");
        }
    }
}

/// Convenience for hosts: emit a run request and resolve the outcome the
/// attached runner produced.
pub async fn request_step_run(bus: &EventBus) -> Option<StepOutcome> {
    bus.emit_await(EventKind::RunStep, EventPayload::None)
        .await
        .into_iter()
        .find_map(|r| match r {
            EventResult::Step(outcome) => Some(outcome),
            _ => None,
        })
}
