//! Batches: per-run bundles of input files plus their batch parameters.
//!
//! The batch list is sparse. Deleting a batch leaves a hole so the indices
//! of the remaining batches, and everything persisted against them, stay
//! stable. Users see positions counted over non-hole entries only.

use crate::params::SettingMap;
use crate::persist::PARAM_SET_CURRENT;
use crate::pipeline::definition::PipelineDefinition;
use crate::types::{BatchInfo, DataKey, LoadedInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One batch: a file (or nothing yet) per pipeline input, the per-batch
/// parameter values, and the parameter set its runs use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleDataBatch {
    pub inputs: BTreeMap<DataKey, Option<LoadedInput>>,
    pub batch_settings: SettingMap,
    pub settings_set_name: String,
}

impl SingleDataBatch {
    /// An empty batch for the given definition: every input key present
    /// but unassigned.
    pub fn blank(definition: &PipelineDefinition, settings_set_name: Option<&str>) -> Self {
        Self {
            inputs: definition
                .inputs
                .iter()
                .map(|i| (i.key.clone(), None))
                .collect(),
            batch_settings: definition.default_batch_settings(),
            settings_set_name: settings_set_name.unwrap_or(PARAM_SET_CURRENT).to_string(),
        }
    }

    /// True when every input has a file assigned.
    pub fn is_complete(&self) -> bool {
        self.inputs.values().all(|v| v.is_some())
    }

    pub fn loaded_paths(&self) -> Vec<String> {
        self.inputs
            .values()
            .flatten()
            .map(|l| l.file.path.clone())
            .collect()
    }
}

/// The sparse batch list. `None` entries are holes left by deletion.
pub type BatchList = Vec<Option<SingleDataBatch>>;

/// First non-hole batch at or after `from`.
pub fn next_available_batch(batches: &BatchList, from: usize) -> Option<(usize, &SingleDataBatch)> {
    batches
        .iter()
        .enumerate()
        .skip(from)
        .find_map(|(i, b)| b.as_ref().map(|b| (i, b)))
}

/// Deletes the batch at `index`, leaving a hole.
pub fn delete_batch(batches: &mut BatchList, index: usize) {
    if let Some(slot) = batches.get_mut(index) {
        *slot = None;
    }
}

/// User-facing position of `current` within the sparse list.
pub fn batch_info(batches: &BatchList, current: Option<usize>) -> BatchInfo {
    let displayed = current
        .map(|c| batches.iter().take(c).filter(|b| b.is_some()).count())
        .unwrap_or(0);
    let loaded_paths = current
        .and_then(|c| batches.get(c))
        .and_then(|b| b.as_ref())
        .map(|b| b.loaded_paths())
        .unwrap_or_default();
    BatchInfo {
        batch: current,
        displayed,
        total_displayed: batches.iter().filter(|b| b.is_some()).count(),
        loaded_paths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::InputDef;
    use crate::types::LocalFile;
    use serde_json::json;

    fn def() -> PipelineDefinition {
        PipelineDefinition::new(
            "p",
            vec![],
            vec![
                InputDef::new("raw", "Image", vec![]),
                InputDef::new("bg", "Background", vec![]),
            ],
        )
    }

    fn loaded(path: &str) -> Option<LoadedInput> {
        Some(LoadedInput {
            file: LocalFile::new(path, path),
            meta: json!({}),
        })
    }

    #[test]
    fn test_blank_batch_has_all_keys_unassigned() {
        let batch = SingleDataBatch::blank(&def(), None);
        assert_eq!(batch.inputs.len(), 2);
        assert!(!batch.is_complete());
        assert_eq!(batch.settings_set_name, PARAM_SET_CURRENT);
    }

    #[test]
    fn test_deletion_keeps_indices_stable() {
        let d = def();
        let mut batches: BatchList = (0..3).map(|_| Some(SingleDataBatch::blank(&d, None))).collect();
        batches[2].as_mut().unwrap().inputs.insert("raw".into(), loaded("c.png"));

        delete_batch(&mut batches, 1);
        assert_eq!(batches.len(), 3);
        assert!(batches[1].is_none());
        // batch 2 is still batch 2
        assert_eq!(batches[2].as_ref().unwrap().loaded_paths(), vec!["c.png"]);
    }

    #[test]
    fn test_next_available_skips_holes() {
        let d = def();
        let mut batches: BatchList = (0..4).map(|_| Some(SingleDataBatch::blank(&d, None))).collect();
        delete_batch(&mut batches, 1);
        delete_batch(&mut batches, 2);

        assert_eq!(next_available_batch(&batches, 0).unwrap().0, 0);
        assert_eq!(next_available_batch(&batches, 1).unwrap().0, 3);
        assert!(next_available_batch(&batches, 4).is_none());
    }

    #[test]
    fn test_batch_info_counts_non_holes() {
        let d = def();
        let mut batches: BatchList = (0..4).map(|_| Some(SingleDataBatch::blank(&d, None))).collect();
        delete_batch(&mut batches, 0);

        let info = batch_info(&batches, Some(2));
        assert_eq!(info.batch, Some(2));
        assert_eq!(info.displayed, 1);
        assert_eq!(info.total_displayed, 3);

        let info = batch_info(&batches, None);
        assert_eq!(info.displayed, 0);
        assert_eq!(info.total_displayed, 3);
    }
}
