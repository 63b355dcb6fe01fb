//! Static pipeline definitions: steps, inputs, outputs and aggregators.
//!
//! A definition is data, not behavior. The engine validates it once on
//! load; the single-writer rule (each data key produced by at most one
//! step) is what makes invalidation well defined.

use crate::error::{CoreError, Result};
use crate::params::{ParameterDef, SettingMap};
use crate::types::{DataKey, ModuleId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// How one kind of file becomes a pipeline input.
#[derive(Debug, Clone)]
pub struct LoaderSpec {
    /// Lowercased extensions this loader accepts, without the dot.
    pub extensions: Vec<String>,
    /// Worker-side loader to invoke.
    pub loader_id: String,
    /// Static arguments passed to the loader.
    pub params: Value,
}

impl LoaderSpec {
    pub fn new(loader_id: impl Into<String>, extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            loader_id: loader_id.into(),
            params: Value::Null,
        }
    }
}

/// One user-provided input of the pipeline.
#[derive(Debug, Clone)]
pub struct InputDef {
    pub key: DataKey,
    pub title: String,
    pub loaders: Vec<LoaderSpec>,
}

impl InputDef {
    pub fn new(key: impl Into<DataKey>, title: impl Into<String>, loaders: Vec<LoaderSpec>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            loaders,
        }
    }

    /// All extensions this input accepts, across its loaders, first
    /// occurrence wins.
    pub fn accepted_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        for loader in &self.loaders {
            for ext in &loader.extensions {
                if !extensions.contains(ext) {
                    extensions.push(ext.clone());
                }
            }
        }
        extensions
    }

    /// Picks the loader for a file by its extension.
    pub fn loader_for(&self, file_name: &str) -> Option<&LoaderSpec> {
        let ext = file_name.rsplit_once('.')?.1.to_lowercase();
        self.loaders
            .iter()
            .find(|l| l.extensions.iter().any(|e| *e == ext))
    }
}

/// A per-batch exportable output.
#[derive(Debug, Clone)]
pub struct OutputDef {
    /// The data key that must exist for this output to be exportable.
    pub required_input: DataKey,
    pub title: String,
    pub exporter_params: Value,
}

/// A cross-batch aggregate output.
#[derive(Debug, Clone)]
pub struct AggregatorDef {
    pub aggregator_id: String,
    pub title: String,
    pub required_inputs: Vec<DataKey>,
    pub exporter_params: Value,
}

/// One step of the pipeline.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub module_id: ModuleId,
    pub title: String,
    /// Worker-side action name; most modules expose a single one.
    pub action: String,
    pub parameters: Vec<ParameterDef>,
    /// Logical input name -> data key read by this step.
    pub input_keys: BTreeMap<String, DataKey>,
    /// Logical output name -> data key produced by this step.
    pub output_keys: BTreeMap<String, DataKey>,
    /// Static settings sent to the worker when the pipeline loads.
    pub server_params: Value,
}

impl StepDef {
    pub fn new(module_id: impl Into<ModuleId>, title: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            title: title.into(),
            action: "apply".to_string(),
            parameters: Vec::new(),
            input_keys: BTreeMap::new(),
            output_keys: BTreeMap::new(),
            server_params: Value::Null,
        }
    }

    pub fn with_input(mut self, name: &str, key: impl Into<DataKey>) -> Self {
        self.input_keys.insert(name.to_string(), key.into());
        self
    }

    pub fn with_output(mut self, name: &str, key: impl Into<DataKey>) -> Self {
        self.output_keys.insert(name.to_string(), key.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterDef>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Default settings for this step.
    pub fn default_settings(&self) -> SettingMap {
        self.parameters
            .iter()
            .map(|p| (p.key.clone(), p.default.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub steps: Vec<StepDef>,
    pub inputs: Vec<InputDef>,
    /// Per-batch parameters shown on the input screen.
    pub input_parameters: Vec<ParameterDef>,
    pub outputs: Vec<OutputDef>,
    pub aggregator_outputs: Vec<AggregatorDef>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDef>, inputs: Vec<InputDef>) -> Self {
        Self {
            name: name.into(),
            steps,
            inputs,
            input_parameters: Vec::new(),
            outputs: Vec::new(),
            aggregator_outputs: Vec::new(),
        }
    }

    /// Checks the single-writer rule and that step inputs are producible:
    /// every key a step reads is either a pipeline input or some step's
    /// output.
    pub fn validate(&self) -> Result<()> {
        let mut writers: HashMap<&DataKey, &ModuleId> = HashMap::new();
        for step in &self.steps {
            for key in step.output_keys.values() {
                if let Some(prev) = writers.insert(key, &step.module_id) {
                    return Err(CoreError::config(format!(
                        "data key '{key}' is produced by both '{prev}' and '{}'",
                        step.module_id
                    )));
                }
            }
        }
        for step in &self.steps {
            for key in step.input_keys.values() {
                let known = writers.contains_key(key) || self.inputs.iter().any(|i| i.key == *key);
                if !known {
                    return Err(CoreError::config(format!(
                        "step '{}' reads '{key}' which nothing produces",
                        step.module_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, index: usize) -> Option<&StepDef> {
        self.steps.get(index)
    }

    pub fn step_by_module(&self, module_id: &str) -> Option<(usize, &StepDef)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.module_id == module_id)
    }

    /// The accepted extensions of every input, in input order. Paired
    /// with one glob pattern per input when resolving batch globs.
    pub fn input_extension_sets(&self) -> Vec<Vec<String>> {
        self.inputs.iter().map(|i| i.accepted_extensions()).collect()
    }

    /// One default setting map per step, in step order.
    pub fn default_parameters(&self) -> Vec<SettingMap> {
        self.steps.iter().map(|s| s.default_settings()).collect()
    }

    /// Default values of the per-batch input parameters.
    pub fn default_batch_settings(&self) -> SettingMap {
        self.input_parameters
            .iter()
            .map(|p| (p.key.clone(), p.default.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_def() -> PipelineDefinition {
        PipelineDefinition::new(
            "test",
            vec![
                StepDef::new("m1", "Mask").with_input("img", "raw").with_output("mask", "mask"),
                StepDef::new("m2", "Count").with_input("mask", "mask").with_output("n", "count"),
            ],
            vec![InputDef::new("raw", "Image", vec![LoaderSpec::new("imgload", &["png", "tif"])])],
        )
    }

    #[test]
    fn test_validate_accepts_chain() {
        two_step_def().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_two_writers() {
        let mut def = two_step_def();
        def.steps[1] = StepDef::new("m2", "Also Mask").with_output("mask", "mask");
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("mask"));
    }

    #[test]
    fn test_validate_rejects_unproducible_input() {
        let mut def = two_step_def();
        def.steps[1] = StepDef::new("m2", "Count").with_input("x", "ghost");
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_loader_selection_by_extension() {
        let def = two_step_def();
        let input = &def.inputs[0];
        assert!(input.loader_for("scan.TIF").is_some());
        assert!(input.loader_for("notes.txt").is_none());
        assert!(input.loader_for("no_extension").is_none());
    }

    #[test]
    fn test_extension_sets_follow_input_order() {
        let mut def = two_step_def();
        def.inputs.push(InputDef::new(
            "table",
            "Table",
            vec![
                LoaderSpec::new("csvload", &["csv"]),
                LoaderSpec::new("xlsload", &["xlsx", "csv"]),
            ],
        ));
        assert_eq!(
            def.input_extension_sets(),
            vec![vec!["png", "tif"], vec!["csv", "xlsx"]]
        );
    }

    #[test]
    fn test_default_parameters_one_map_per_step() {
        let defaults = two_step_def().default_parameters();
        assert_eq!(defaults.len(), 2);
        assert!(defaults.iter().all(|m| m.is_empty()));
    }
}
