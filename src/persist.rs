//! Persistence of user state across sessions.
//!
//! Values are stored as JSON, either globally or scoped to a pipeline name.
//! [`FileStore`] writes one file per scoped key under the platform data
//! directory; [`MemoryStore`] backs tests and embedded use.
//!
//! Parameter sets are stored in this same key space: the working copy lives
//! under the reserved set key `"current"`, named snapshots beside it.

use crate::config;
use crate::error::{CoreError, Result};
use crate::params::SettingMap;
use crate::types::PipelineName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

/// Global key naming the last loaded pipeline.
pub const KEY_LOADED_PIPELINE: &str = "loaded_pipeline";
/// Per-pipeline key holding the sparse batch list.
pub const KEY_BATCHES: &str = "batches";
/// Per-pipeline key holding the global execution settings.
pub const KEY_GLOBAL_SETTINGS: &str = "global_settings";
/// Per-pipeline key holding all parameter sets.
pub const KEY_PARAM_SETS: &str = "param_sets";
/// Reserved set key for the working copy of parameters.
pub const PARAM_SET_CURRENT: &str = "current";

pub trait Persistence: Send + Sync {
    fn load_global(&self, key: &str) -> Option<Value>;
    fn save_global(&self, key: &str, value: &Value) -> Result<()>;
    fn load_for_pipeline(&self, pipeline: &str, key: &str) -> Option<Value>;
    fn save_for_pipeline(&self, pipeline: &str, key: &str, value: &Value) -> Result<()>;
}

/// One stored snapshot of all step parameters of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// One map per pipeline step, in step order.
    pub data: Vec<SettingMap>,
}

/// Loads all parameter sets of a pipeline, optionally hiding the working
/// copy.
pub fn load_parameter_sets(
    store: &dyn Persistence,
    pipeline: &PipelineName,
    exclude_current: bool,
) -> BTreeMap<String, ParamSet> {
    let mut sets: BTreeMap<String, ParamSet> = store
        .load_for_pipeline(pipeline, KEY_PARAM_SETS)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if exclude_current {
        sets.remove(PARAM_SET_CURRENT);
    }
    sets
}

/// Saves one parameter set under `set_key`, overwriting a previous set of
/// the same key.
pub fn save_parameter_set(
    store: &dyn Persistence,
    pipeline: &PipelineName,
    set_key: &str,
    name: &str,
    description: &str,
    data: &[SettingMap],
) -> Result<()> {
    let mut sets = load_parameter_sets(store, pipeline, false);
    sets.insert(
        set_key.to_string(),
        ParamSet {
            name: name.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            data: data.to_vec(),
        },
    );
    store.save_for_pipeline(pipeline, KEY_PARAM_SETS, &serde_json::to_value(&sets)?)
}

pub fn delete_parameter_set(
    store: &dyn Persistence,
    pipeline: &PipelineName,
    set_key: &str,
) -> Result<()> {
    let mut sets = load_parameter_sets(store, pipeline, false);
    sets.remove(set_key);
    store.save_for_pipeline(pipeline, KEY_PARAM_SETS, &serde_json::to_value(&sets)?)
}

/// Loads the parameters stored under `set_key`, merged over the given
/// defaults. Stored values win only for keys the defaults know; stale keys
/// from older definitions are dropped silently.
pub fn load_parameters(
    store: &dyn Persistence,
    pipeline: &PipelineName,
    defaults: &[SettingMap],
    set_key: &str,
) -> Vec<SettingMap> {
    let stored = load_parameter_sets(store, pipeline, false).remove(set_key);
    let mut merged = defaults.to_vec();
    if let Some(set) = stored {
        for (step, step_defaults) in merged.iter_mut().enumerate() {
            if let Some(stored_step) = set.data.get(step) {
                for (key, value) in stored_step {
                    if step_defaults.contains_key(key) {
                        step_defaults.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
    merged
}

/// In-memory persistence, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped_key(pipeline: &str, key: &str) -> String {
    format!("{pipeline}/{key}")
}

impl Persistence for MemoryStore {
    fn load_global(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn save_global(&self, key: &str, value: &Value) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load_for_pipeline(&self, pipeline: &str, key: &str) -> Option<Value> {
        self.load_global(&scoped_key(pipeline, key))
    }

    fn save_for_pipeline(&self, pipeline: &str, key: &str, value: &Value) -> Result<()> {
        self.save_global(&scoped_key(pipeline, key), value)
    }
}

/// File-backed persistence: one JSON file per key under a base directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Opens the store in the platform data directory, creating it.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(config::ensure_app_data_dir()?.join("state")))
    }

    fn path_for(&self, scope: Option<&str>, key: &str) -> PathBuf {
        let name = match scope {
            Some(pipeline) => format!("{}__{}.json", sanitize(pipeline), sanitize(key)),
            None => format!("{}.json", sanitize(key)),
        };
        self.dir.join(name)
    }

    fn read(&self, path: &PathBuf) -> Option<Value> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt state file");
                None
            }
        }
    }

    fn write(&self, path: &PathBuf, value: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, serde_json::to_string_pretty(value)?)
            .map_err(|e| CoreError::Io(e).with_context(format!("writing {}", path.display())))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

impl Persistence for FileStore {
    fn load_global(&self, key: &str) -> Option<Value> {
        self.read(&self.path_for(None, key))
    }

    fn save_global(&self, key: &str, value: &Value) -> Result<()> {
        self.write(&self.path_for(None, key), value)
    }

    fn load_for_pipeline(&self, pipeline: &str, key: &str) -> Option<Value> {
        self.read(&self.path_for(Some(pipeline), key))
    }

    fn save_for_pipeline(&self, pipeline: &str, key: &str, value: &Value) -> Result<()> {
        self.write(&self.path_for(Some(pipeline), key), value)
    }
}
