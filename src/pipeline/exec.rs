//! Automatic pipeline execution.
//!
//! The scheduler drives step after step through the bus: it emits a
//! `RunStep` request, then consumes the `StepCompleted` feed. Completions
//! for a module other than the current step are logged and ignored, so a
//! manually triggered stray run cannot advance the pipeline. At the end of
//! a batch it runs the enabled exports, then the enabled aggregates, and
//! either stops or moves on to the next available batch.
//!
//! `stop` only detaches the completion listener and resets the mode; an
//! in-flight worker call keeps running and its completion is consumed by
//! nobody.

use crate::error::Result;
use crate::events::{EventKind, EventPayload, EventReply, EventResult, StepOutcome};
use crate::pipeline::batch::{batch_info, next_available_batch};
use crate::pipeline::data::step_missing_inputs;
use crate::pipeline::{loader, CoreContext};
use crate::types::{ExecutionState, LogKind, Screen};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const LISTENER_ID: &str = "auto-exec";

enum BatchEnd {
    Continue,
    Stopped,
}

pub struct ExecutionScheduler {
    ctx: CoreContext,
    completion_tx: mpsc::UnboundedSender<StepOutcome>,
    completion_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StepOutcome>>,
}

impl ExecutionScheduler {
    pub fn new(ctx: CoreContext) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            completion_tx,
            completion_rx: tokio::sync::Mutex::new(completion_rx),
        }
    }

    /// Starts automatic execution at `batch_index` (or the next available
    /// batch after it), clearing the run log. Resolves when execution
    /// stops.
    pub async fn start(&self, batch_index: usize) -> Result<()> {
        self.launch(batch_index, true, ExecutionState::Running).await
    }

    /// Like [`start`](Self::start), but stops once the batch reaches its
    /// output stage.
    pub async fn start_until_next_export(&self, batch_index: usize) -> Result<()> {
        self.launch(batch_index, true, ExecutionState::RunningUntilNextExport)
            .await
    }

    /// Continues execution from wherever the user currently is: on the
    /// input screen the shown batch starts over, after an output stage the
    /// next batch begins, mid-pipeline the current step is re-requested
    /// (an unchanged step resolves as a free success).
    pub async fn resume(&self, stop_at_next_export: bool) -> Result<()> {
        let mode = if stop_at_next_export {
            ExecutionState::RunningUntilNextExport
        } else {
            ExecutionState::Running
        };
        match self.ctx.store.get(&self.ctx.cells.screen) {
            Screen::Input => {
                let index = self.ctx.store.get(&self.ctx.cells.cur_batch).unwrap_or(0);
                self.launch(index, false, mode).await
            }
            Screen::Output | Screen::Aggregate => {
                let from = self
                    .ctx
                    .store
                    .get(&self.ctx.cells.cur_batch)
                    .map(|c| c + 1)
                    .unwrap_or(0);
                let batches = self.ctx.store.get(&self.ctx.cells.batches);
                match next_available_batch(&batches, from) {
                    Some((index, _)) => self.launch(index, false, mode).await,
                    None => {
                        self.ctx.log("Completed all Input Data", LogKind::Info, None);
                        self.stop();
                        Ok(())
                    }
                }
            }
            Screen::Pipeline => {
                self.attach();
                self.ctx.store.set(&self.ctx.cells.execution_state, mode);
                self.drive().await;
                Ok(())
            }
        }
    }

    /// Detaches the completion listener and drops back to manual mode.
    /// In-flight worker calls are not cancelled.
    pub fn stop(&self) {
        self.ctx.bus.off(LISTENER_ID, Some(EventKind::StepCompleted));
        self.ctx
            .store
            .set(&self.ctx.cells.execution_state, ExecutionState::Manual);
    }

    async fn launch(
        &self,
        batch_index: usize,
        clear_log: bool,
        mode: ExecutionState,
    ) -> Result<()> {
        if clear_log {
            self.ctx.store.set(&self.ctx.cells.log, Vec::new());
        }
        if !self.begin_batch(batch_index).await {
            return Ok(());
        }
        self.attach();
        self.ctx.store.set(&self.ctx.cells.execution_state, mode);
        self.drive().await;
        Ok(())
    }

    /// Feeds step completions into the drive loop. Re-attaching replaces
    /// the listener in place, so repeated starts never stack listeners.
    fn attach(&self) {
        let tx = self.completion_tx.clone();
        self.ctx
            .bus
            .on(EventKind::StepCompleted, LISTENER_ID, move |payload| {
                if let EventPayload::StepCompleted(outcome) = payload {
                    let _ = tx.send(outcome);
                }
                EventReply::none()
            });
    }

    /// Loads the batch at `index` (or the next available one) and readies
    /// the pipeline for step 0. Returns whether execution can proceed.
    async fn begin_batch(&self, index: usize) -> bool {
        let store = &self.ctx.store;
        let cells = &self.ctx.cells;
        let batches = store.get(&cells.batches);
        let resolved = match batches.get(index).and_then(|b| b.as_ref()) {
            Some(b) => Some((index, b)),
            None => next_available_batch(&batches, index),
        };
        let Some((index, batch)) = resolved else {
            self.ctx.log("No available batch to run.", LogKind::Info, None);
            self.stop();
            return false;
        };
        let set_name = batch.settings_set_name.clone();

        if let Err(e) = loader::load_batch(&self.ctx, index, true).await {
            self.ctx
                .log(format!("Could not load data for batch: {e}"), LogKind::Fail, None);
            self.stop();
            return false;
        }
        let data = store.get(&cells.data);
        let missing = step_missing_inputs(&self.ctx.definition, &data, 0);
        if !missing.is_empty() {
            self.ctx.log(
                format!("Cannot run pipeline, missing inputs: {}", missing.join(", ")),
                LogKind::Fail,
                None,
            );
            self.stop();
            return false;
        }

        self.ctx.log(
            format!("Running batch with parameter set '{set_name}'."),
            LogKind::Info,
            None,
        );
        let inputs = store.get(&cells.inputs);
        let paths: Vec<String> = inputs.values().map(|l| l.file.path.clone()).collect();
        self.ctx
            .log(format!("Inputs: {}", paths.join(", ")), LogKind::Info, None);
        store.set(&cells.cur_step, 0);
        store.set(&cells.screen, Screen::Pipeline);
        true
    }

    async fn drive(&self) {
        let store = &self.ctx.store;
        let cells = &self.ctx.cells;
        let mut rx = self.completion_rx.lock().await;
        // drop completions left over from an earlier run
        while rx.try_recv().is_ok() {}

        loop {
            if store.get(&cells.execution_state) == ExecutionState::Manual {
                break;
            }
            let started = Instant::now();
            let replies = self
                .ctx
                .bus
                .emit_await(EventKind::RunStep, EventPayload::None)
                .await;
            if !replies.iter().any(|r| matches!(r, EventResult::Step(_))) {
                self.ctx
                    .log("No step handler is attached; stopping.", LogKind::Fail, None);
                self.stop();
                break;
            }

            let outcome = loop {
                let Some(outcome) = rx.recv().await else {
                    self.stop();
                    return;
                };
                let index = store.get(&cells.cur_step);
                match self.ctx.definition.step(index) {
                    Some(step) if step.module_id == outcome.module_id => break outcome,
                    Some(step) => self.ctx.log(
                        format!(
                            "Completed step '{}' is not the current step '{}', ignoring.",
                            outcome.module_id, step.title
                        ),
                        LogKind::Fail,
                        None,
                    ),
                    None => {
                        self.stop();
                        return;
                    }
                }
            };

            let index = store.get(&cells.cur_step);
            let title = self
                .ctx
                .definition
                .step(index)
                .map(|s| s.title.clone())
                .unwrap_or_else(|| outcome.module_id.clone());
            if !outcome.success {
                self.ctx.log(
                    format!(
                        "{title}: Error: {}",
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                    LogKind::Fail,
                    Some(started.elapsed()),
                );
                self.stop();
                break;
            }
            self.ctx.log(
                format!("{title}: Completed"),
                LogKind::Success,
                Some(started.elapsed()),
            );

            let pause = store.get(&cells.global_settings).pause_to_see_results_ms;
            if pause > 0 {
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }

            if index + 1 < self.ctx.definition.steps.len() {
                store.set(&cells.cur_step, index + 1);
                continue;
            }
            match self.finish_batch().await {
                BatchEnd::Continue => continue,
                BatchEnd::Stopped => break,
            }
        }
    }

    /// End of a batch: exports, aggregates, completion bookkeeping and the
    /// transition to the next batch (or to a stop).
    async fn finish_batch(&self) -> BatchEnd {
        let store = &self.ctx.store;
        let cells = &self.ctx.cells;
        let settings = store.get(&cells.global_settings);

        if !settings.run_batch_exports.is_empty() {
            store.set(&cells.screen, Screen::Output);
            let results = self
                .ctx
                .bus
                .emit_await(EventKind::RunExport, EventPayload::None)
                .await;
            let mut failed = false;
            for result in results {
                let EventResult::Export(outcome) = result else { continue };
                if !settings.run_batch_exports.contains(&outcome.output_key) {
                    continue;
                }
                if outcome.success {
                    let dest = outcome
                        .destination
                        .map(|d| format!(" to {d}"))
                        .unwrap_or_default();
                    self.ctx.log(
                        format!("Exported {}{dest}", outcome.title),
                        LogKind::Success,
                        None,
                    );
                } else {
                    failed = true;
                    self.ctx.log(
                        format!(
                            "Error exporting {}: {}",
                            outcome.title,
                            outcome.error.as_deref().unwrap_or("unknown error")
                        ),
                        LogKind::Fail,
                        None,
                    );
                }
            }
            if failed {
                self.stop();
                return BatchEnd::Stopped;
            }
        }

        if !settings.run_aggregate_exports.is_empty() {
            store.set(&cells.screen, Screen::Aggregate);
            let results = self
                .ctx
                .bus
                .emit_await(EventKind::RunAggregate, EventPayload::None)
                .await;
            let mut failed = false;
            for result in results {
                let EventResult::Aggregate(outcome) = result else { continue };
                if !settings.run_aggregate_exports.contains(&outcome.aggregator_id) {
                    continue;
                }
                if outcome.success {
                    self.ctx
                        .log(format!("Aggregated {}", outcome.title), LogKind::Success, None);
                } else {
                    failed = true;
                    self.ctx.log(
                        format!(
                            "Error aggregating {}: {}",
                            outcome.title,
                            outcome.error.as_deref().unwrap_or("unknown error")
                        ),
                        LogKind::Fail,
                        None,
                    );
                }
            }
            if failed {
                self.stop();
                return BatchEnd::Stopped;
            }
        }

        let batches = store.get(&cells.batches);
        let current = store.get(&cells.cur_batch);
        let info = batch_info(&batches, current);
        self.ctx.log(
            format!("Completed Batch {}/{}", info.displayed + 1, info.total_displayed),
            LogKind::Success,
            None,
        );

        if store.get(&cells.execution_state) == ExecutionState::RunningUntilNextExport {
            self.ctx
                .log("Stopping execution at output stage.", LogKind::Info, None);
            self.stop();
            return BatchEnd::Stopped;
        }

        let from = current.map(|c| c + 1).unwrap_or(0);
        match next_available_batch(&batches, from) {
            Some((index, _)) => {
                store.set(&cells.screen, Screen::Input);
                if self.begin_batch(index).await {
                    BatchEnd::Continue
                } else {
                    BatchEnd::Stopped
                }
            }
            None => {
                self.ctx.log("Completed all Input Data", LogKind::Info, None);
                self.stop();
                BatchEnd::Stopped
            }
        }
    }
}
