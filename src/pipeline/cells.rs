//! The engine's shared cells, declared in one place.

use crate::events::{EventBus, EventKind, EventPayload};
use crate::params::{ParameterDef, SettingMap};
use crate::persist::{save_parameter_set, Persistence, PARAM_SET_CURRENT};
use crate::pipeline::batch::BatchList;
use crate::pipeline::data::DataMap;
use crate::pipeline::definition::PipelineDefinition;
use crate::store::{CellHandle, StateStore};
use crate::types::{
    DataKey, ExecutionState, LoadedInput, LogEntry, LogKind, OverlayState, Screen,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings that steer automatic execution, persisted per pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Outputs exported at the end of each batch.
    pub run_batch_exports: Vec<DataKey>,
    /// Aggregates run after the batch exports.
    pub run_aggregate_exports: Vec<String>,
    /// Pause between auto-executed steps, in ms.
    pub pause_to_see_results_ms: u64,
}

impl GlobalSettings {
    /// Everything enabled, pause from config.
    pub fn defaults_for(definition: &PipelineDefinition, pause_ms: u64) -> Self {
        Self {
            run_batch_exports: definition.outputs.iter().map(|o| o.required_input.clone()).collect(),
            run_aggregate_exports: definition
                .aggregator_outputs
                .iter()
                .map(|a| a.aggregator_id.clone())
                .collect(),
            pause_to_see_results_ms: pause_ms,
        }
    }
}

/// Handles to every cell the engine owns. Declared against one store;
/// cheap to clone.
#[derive(Clone)]
pub struct CoreCells {
    /// Name of the loaded pipeline.
    pub pipeline_name: CellHandle<String>,
    /// All pipeline data of the current batch.
    pub data: CellHandle<DataMap>,
    /// The loaded input files of the current batch.
    pub inputs: CellHandle<BTreeMap<DataKey, LoadedInput>>,
    /// The sparse batch list.
    pub batches: CellHandle<BatchList>,
    /// Index of the loaded batch within the list.
    pub cur_batch: CellHandle<Option<usize>>,
    /// Millisecond timestamp of the last batch load, for cache busting.
    pub batch_timestamp: CellHandle<i64>,
    /// Index of the step the user currently works on.
    pub cur_step: CellHandle<usize>,
    /// One setting map per step.
    pub parameters: CellHandle<Vec<SettingMap>>,
    pub global_settings: CellHandle<GlobalSettings>,
    pub execution_state: CellHandle<ExecutionState>,
    pub screen: CellHandle<Screen>,
    pub log: CellHandle<Vec<LogEntry>>,
    pub overlay: CellHandle<Option<OverlayState>>,
}

impl CoreCells {
    pub fn declare(store: &StateStore) -> Self {
        Self {
            pipeline_name: store.declare("pipeline_name", String::new()),
            data: store.declare("pipeline_data", DataMap::new()),
            inputs: store.declare("pipeline_inputs", BTreeMap::new()),
            batches: store.declare("batches", BatchList::new()),
            cur_batch: store.declare("cur_batch", None),
            batch_timestamp: store.declare("batch_timestamp", 0),
            cur_step: store.declare("cur_step", 0),
            parameters: store.declare("parameters", Vec::new()),
            global_settings: store.declare("global_settings", GlobalSettings::default()),
            execution_state: store.declare("execution_state", ExecutionState::Manual),
            screen: store.declare("screen", Screen::Input),
            log: store.declare("log", Vec::new()),
            overlay: store.declare("overlay", None),
        }
    }
}

/// Appends one run-log entry, dropping the oldest past `limit`.
pub fn append_log(
    store: &StateStore,
    cells: &CoreCells,
    message: impl Into<String>,
    kind: LogKind,
    duration: Option<Duration>,
    limit: usize,
) {
    let entry = LogEntry::new(message, kind, duration);
    store.update(&cells.log, |mut log| {
        log.push(entry);
        if log.len() > limit {
            let overflow = log.len() - limit;
            log.drain(..overflow);
        }
        log
    });
}

/// Sets one parameter of one step from an untyped client value.
///
/// The raw value is coerced to the parameter's declared kind; writes that
/// deep-equal the current value do nothing. A real change is persisted into
/// the working parameter set and announced on the bus, flagged with whether
/// the worker cares. Returns whether anything changed.
pub fn set_parameter_value(
    store: &StateStore,
    cells: &CoreCells,
    bus: &EventBus,
    persistence: &dyn Persistence,
    step_index: usize,
    param: &ParameterDef,
    raw: &serde_json::Value,
) -> bool {
    let value = param.kind.coerce(raw);
    let mut parameters = store.get(&cells.parameters);
    let Some(step_settings) = parameters.get_mut(step_index) else {
        tracing::warn!(step_index, key = %param.key, "parameter write to unknown step");
        return false;
    };
    if step_settings.get(&param.key) == Some(&value) {
        return false;
    }
    step_settings.insert(param.key.clone(), value);

    store.set(&cells.parameters, parameters.clone());
    let pipeline = store.get(&cells.pipeline_name);
    if let Err(e) = save_parameter_set(
        persistence,
        &pipeline,
        PARAM_SET_CURRENT,
        PARAM_SET_CURRENT,
        "",
        &parameters,
    ) {
        tracing::warn!(error = %e, "could not persist parameter change");
    }
    bus.emit(
        EventKind::ParametersChanged,
        EventPayload::ParametersChanged(param.server_relevant()),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterKind, ParameterValue};
    use crate::persist::{load_parameter_sets, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_log_limit() {
        let store = StateStore::new();
        let cells = CoreCells::declare(&store);
        for i in 0..5 {
            append_log(&store, &cells, format!("e{i}"), LogKind::Info, None, 3);
        }
        let log = store.get(&cells.log);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].message, "e2");
    }

    #[test]
    fn test_set_parameter_value_coerces_and_announces() {
        let store = StateStore::new();
        let cells = CoreCells::declare(&store);
        let bus = EventBus::new();
        let persistence = MemoryStore::new();
        store.set(&cells.pipeline_name, "p".to_string());
        store.set(&cells.parameters, vec![SettingMap::new()]);

        let announced = Arc::new(AtomicUsize::new(0));
        let announced2 = Arc::clone(&announced);
        bus.on(EventKind::ParametersChanged, "t", move |p| {
            if let EventPayload::ParametersChanged(relevant) = p {
                assert!(relevant);
                announced2.fetch_add(1, Ordering::SeqCst);
            }
            crate::events::EventReply::none()
        });

        let param = ParameterDef::new(
            "threshold",
            ParameterKind::IntRange,
            ParameterValue::IntRange(0, None),
        );
        assert!(set_parameter_value(&store, &cells, &bus, &persistence, 0, &param, &json!("17")));
        assert_eq!(
            store.get(&cells.parameters)[0]["threshold"],
            ParameterValue::IntRange(17, None)
        );
        assert_eq!(announced.load(Ordering::SeqCst), 1);
        assert!(load_parameter_sets(&persistence, &"p".to_string(), false)
            .contains_key(PARAM_SET_CURRENT));

        // same value again: no change, no event
        assert!(!set_parameter_value(&store, &cells, &bus, &persistence, 0, &param, &json!(17)));
        assert_eq!(announced.load(Ordering::SeqCst), 1);
    }
}
