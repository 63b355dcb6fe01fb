//! Error types for the engine.
//!
//! One crate-wide error enum; remote failures carry the worker's message
//! and stack trace verbatim so they can be shown to the user.

use crate::types::DataKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The worker reported a failure for a call. The trace is the worker's
    /// own stack trace, line by line.
    #[error("Remote call failed: {message}")]
    Remote { message: String, trace: Vec<String> },

    /// A threaded call was cancelled locally. The worker keeps running; the
    /// engine only stops listening for its result.
    #[error("Aborted")]
    Aborted,

    /// A step was asked to run while some of its input keys are absent.
    #[error("Missing pipeline data: {}", .0.join(", "))]
    MissingDependency(Vec<DataKey>),

    /// No worker transport is connected.
    #[error("Worker connection not established")]
    BridgeUnavailable,

    #[error("Configuration error: {0}")]
    Config(String),

    /// A completion channel was dropped before a result arrived. Happens
    /// when a newer call stomps a pending one on the same thread id.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CoreError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        CoreError::Remote {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config(message.into())
    }

    /// True if this error (or the one it wraps) is a local abort.
    pub fn is_aborted(&self) -> bool {
        match self {
            CoreError::Aborted => true,
            CoreError::WithContext { source, .. } => source.is_aborted(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Extension trait for adding context to results.
pub trait ResultExt<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Remote {
            message: "division by zero".into(),
            trace: vec!["worker.py:12".into()],
        };
        assert_eq!(err.to_string(), "Remote call failed: division by zero");

        let err = CoreError::MissingDependency(vec!["mask".into(), "cells".into()]);
        assert_eq!(err.to_string(), "Missing pipeline data: mask, cells");
    }

    #[test]
    fn test_context_chain() {
        let err: Result<()> = Err(CoreError::Aborted);
        let err = err.context("running step align").unwrap_err();
        assert_eq!(err.to_string(), "running step align: Aborted");
        assert!(err.is_aborted());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
