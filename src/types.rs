//! Shared value types used across the engine.
//!
//! Everything here is plain data: identifiers, file handles, log entries and
//! the small state enums that live inside [`crate::store::StateStore`] cells.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Globally unique string identifying one named artifact flowing between
/// pipeline steps. Two steps may read the same key (fan-out) but a key is
/// produced by at most one step.
pub type DataKey = String;

/// Identifier of one pipeline step's worker-side module.
pub type ModuleId = String;

/// Caller-chosen identifier for a threaded worker call. Steps use their
/// module id, so only one threaded call per step is ever in flight.
pub type ThreadId = String;

/// Key of a single tunable parameter, unique within its step.
pub type ParameterKey = String;

/// Name of a pipeline definition, used to scope persisted state.
pub type PipelineName = String;

/// A file on the local machine as the worker reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFile {
    pub name: String,
    pub path: String,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Lowercased extension, if the name has one.
    pub fn extension(&self) -> Option<String> {
        self.name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
    }
}

/// A pipeline input file after the worker loaded it: the file handle plus
/// whatever preview/metadata the loader returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedInput {
    pub file: LocalFile,
    pub meta: serde_json::Value,
}

/// Severity of one run-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Success,
    Fail,
    Info,
}

/// One entry of the append-only run log. Written for the user's audit,
/// never read back into control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub kind: LogKind,
    pub time: DateTime<Utc>,
    /// Elapsed time of the operation this entry describes, when measured.
    pub duration: Option<Duration>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, kind: LogKind, duration: Option<Duration>) -> Self {
        Self {
            message: message.into(),
            kind,
            time: Utc::now(),
            duration,
        }
    }
}

/// Mode of the automatic pipeline execution. Mutated only by the
/// [`crate::pipeline::exec::ExecutionScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Not running; every step is triggered by hand.
    #[default]
    Manual,
    /// Play until no batches remain.
    Running,
    /// Play until the current batch reaches its output stage.
    RunningUntilNextExport,
}

/// Engine-visible projection of which stage the client currently shows.
/// Drives how [`resume`](crate::pipeline::exec::ExecutionScheduler::resume)
/// dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    #[default]
    Input,
    Pipeline,
    Output,
    Aggregate,
}

/// A blocking overlay shown while something runs. Progress signals from the
/// worker decorate this; they never create one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayState {
    pub message: String,
    /// Fraction in 0..=1 when known.
    pub progress: Option<f64>,
}

impl OverlayState {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            progress: None,
        }
    }

    pub fn with_progress(message: impl Into<String>, progress: f64) -> Self {
        Self {
            message: message.into(),
            progress: Some(progress),
        }
    }
}

/// User-facing view of the current batch position. The batch list is sparse,
/// so the displayed number counts only non-hole entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    /// Raw index into the sparse batch list, if a batch is loaded.
    pub batch: Option<usize>,
    /// Zero-based position among the non-hole batches.
    pub displayed: usize,
    /// Number of non-hole batches.
    pub total_displayed: usize,
    /// Paths of the files loaded into the current batch.
    pub loaded_paths: Vec<String>,
}

/// Listing of a folder as returned by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderContents {
    pub files: Vec<LocalFile>,
    pub folders: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_file_extension() {
        let f = LocalFile::new("img1.PNG", "/data/img1.PNG");
        assert_eq!(f.extension().as_deref(), Some("png"));
        assert_eq!(LocalFile::new("noext", "/x").extension(), None);
    }

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = LogEntry::new("done", LogKind::Success, Some(Duration::from_millis(120)));
        let json = serde_json::to_string(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn test_execution_state_default_is_manual() {
        assert_eq!(ExecutionState::default(), ExecutionState::Manual);
    }
}
