//! TOML settings and the on-disk data layout.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use affect_core::BridgeConfig;
use serde::{Deserialize, Serialize};

use crate::backup::BackupConfig;
use crate::checkpoint::CheckpointConfig;
use crate::error::{Result, StoreError};

pub const DATA_DIR_ENV: &str = "AFFECT_DATA_DIR";
pub const SETTINGS_FILE: &str = "config.toml";

fn default_base_dir() -> PathBuf {
    dirs_home().join(".affect-memory")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
    pub bridge: BridgeConfig,
    pub backup: BackupConfig,
    pub checkpoint: CheckpointConfig,
}

impl Settings {
    /// Parse a settings file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.bridge.validate()?;
        Ok(settings)
    }

    /// Explicit directory, then `AFFECT_DATA_DIR`, then the settings file,
    /// then `~/.affect-memory`.
    pub fn resolve_data_dir(&self, explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(default_base_dir)
    }
}

/// Fixed file locations under a data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn engine_path(&self) -> PathBuf {
        self.root.join("engine.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.checkpoint.max_checkpoints, 10);
        assert_eq!(settings.bridge.n_qubits, 27);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let settings = Settings::from_toml_str(
            r#"
data_dir = "/tmp/affect"

[bridge]
n_qubits = 12
entanglement_pattern = "star"

[bridge.noise.thermal]
enabled = false
rate = 0.0

[backup]
compress = false

[checkpoint]
auto_interval_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(settings.data_dir, Some(PathBuf::from("/tmp/affect")));
        assert_eq!(settings.bridge.n_qubits, 12);
        assert_eq!(settings.bridge.default_shots, 1024);
        assert!(!settings.bridge.noise.thermal.enabled);
        assert!(settings.bridge.noise.dephasing.enabled);
        assert!(!settings.backup.compress);
        assert_eq!(settings.backup.max_backups, 10);
        assert_eq!(settings.checkpoint.auto_interval_secs, 60);
        assert_eq!(settings.checkpoint.join_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_bridge_config_is_rejected() {
        let result = Settings::from_toml_str("[bridge]\nreadout_error = 0.9\n");
        assert!(matches!(result, Err(StoreError::Core(_))));
        assert!(matches!(Settings::from_toml_str("bridge = 3"), Err(StoreError::Toml(_))));
    }

    #[test]
    fn test_explicit_dir_wins() {
        let settings = Settings {
            data_dir: Some(PathBuf::from("/from/settings")),
            ..Settings::default()
        };
        assert_eq!(
            settings.resolve_data_dir(Some(Path::new("/explicit"))),
            PathBuf::from("/explicit")
        );
        let layout = DataLayout::new("/explicit");
        assert_eq!(layout.engine_path(), PathBuf::from("/explicit/engine.json"));
    }
}
