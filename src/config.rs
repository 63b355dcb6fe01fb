//! On-disk engine configuration.
//!
//! A small TOML file under the platform data directory. Everything has a
//! default so a missing or partial file never blocks startup.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const APP_ID: &str = "dev.labflow.core";
const CONFIG_FILE: &str = "core.toml";

/// Returns the platform-specific data directory for the engine.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|d| d.join(APP_ID))
}

/// Returns the data directory, creating it if needed.
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir()
        .ok_or_else(|| CoreError::config("could not determine platform data directory"))?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Pause between auto-executed steps so results stay visible, in ms.
    pub pause_to_see_results_ms: u64,
    /// Override for where persisted state lives. Platform default when unset.
    pub data_dir: Option<PathBuf>,
    /// Run-log entries kept before the oldest are dropped.
    pub log_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pause_to_see_results_ms: 1000,
            data_dir: None,
            log_limit: 500,
        }
    }
}

impl CoreConfig {
    pub fn default_path() -> Option<PathBuf> {
        app_data_dir().map(|d| d.join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Loads the config at `path`, falling back to defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "using default config");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        let mut cfg = CoreConfig::default();
        cfg.pause_to_see_results_ms = 250;
        cfg.save(&path).unwrap();

        let loaded = CoreConfig::load(&path).unwrap();
        assert_eq!(loaded.pause_to_see_results_ms, 250);
        assert_eq!(loaded.log_limit, CoreConfig::default().log_limit);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let cfg = CoreConfig::load_or_default(Path::new("/nonexistent/core.toml"));
        assert_eq!(cfg.pause_to_see_results_ms, 1000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        std::fs::write(&path, "pause_to_see_results_ms = 0\n").unwrap();
        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.pause_to_see_results_ms, 0);
        assert_eq!(cfg.log_limit, 500);
    }
}
