//! The data store for one loaded batch, and the invalidation that keeps it
//! consistent.
//!
//! When a key is written, everything derivable from it downstream is stale
//! and gets removed. Derivation follows the step graph: a step that reads
//! the written key taints all of its outputs, transitively. Writes that
//! deep-equal the current value change nothing and invalidate nothing.

use crate::pipeline::definition::PipelineDefinition;
use crate::store::{CellHandle, StateStore};
use crate::types::DataKey;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// All currently present pipeline data, keyed by data key.
pub type DataMap = BTreeMap<DataKey, Value>;

/// Keys strictly downstream of `key`: outputs of every step reachable from
/// it. The written key itself is not included.
pub fn downstream_keys(definition: &PipelineDefinition, key: &str) -> BTreeSet<DataKey> {
    let mut result = BTreeSet::new();
    let mut queue: VecDeque<DataKey> = VecDeque::from([key.to_string()]);
    while let Some(current) = queue.pop_front() {
        for step in &definition.steps {
            if !step.input_keys.values().any(|k| *k == current) {
                continue;
            }
            for out in step.output_keys.values() {
                if out != key && result.insert(out.clone()) {
                    queue.push_back(out.clone());
                }
            }
        }
    }
    result
}

/// Outcome of one data write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invalidation {
    /// Whether the written key itself changed.
    pub changed: bool,
    /// Downstream keys that were present and got removed.
    pub removed: BTreeSet<DataKey>,
}

/// Applies a write (or a clear, for `None`) to a data map, removing stale
/// downstream keys. Deep-equal writes are a complete no-op.
pub fn apply_data_write(
    definition: &PipelineDefinition,
    data: &mut DataMap,
    key: &str,
    value: Option<Value>,
) -> Invalidation {
    let unchanged = match &value {
        Some(v) => data.get(key) == Some(v),
        None => !data.contains_key(key),
    };
    if unchanged {
        return Invalidation::default();
    }

    match value {
        Some(v) => data.insert(key.to_string(), v),
        None => data.remove(key),
    };

    let mut removed = BTreeSet::new();
    for stale in downstream_keys(definition, key) {
        if data.remove(&stale).is_some() {
            removed.insert(stale);
        }
    }
    Invalidation {
        changed: true,
        removed,
    }
}

/// Cell-level variant of [`apply_data_write`]: reads the data cell, applies
/// the write and publishes the new map only when something changed.
pub fn update_pipeline_data(
    store: &StateStore,
    data_cell: &CellHandle<DataMap>,
    definition: &PipelineDefinition,
    key: &str,
    value: Option<Value>,
) -> Invalidation {
    let mut data = store.get(data_cell);
    let result = apply_data_write(definition, &mut data, key, value);
    if result.changed {
        if !result.removed.is_empty() {
            tracing::debug!(key, removed = ?result.removed, "invalidated downstream data");
        }
        store.set(data_cell, data);
    }
    result
}

/// The input keys of step `index` that are absent from the data map.
pub fn step_missing_inputs(
    definition: &PipelineDefinition,
    data: &DataMap,
    index: usize,
) -> Vec<DataKey> {
    match definition.step(index) {
        Some(step) => step
            .input_keys
            .values()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}
