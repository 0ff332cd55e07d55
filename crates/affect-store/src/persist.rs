//! Engine save/load: a versioned JSON document plus a bincode side-car.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use affect_core::{ClassicalBridge, EngineDocument, StateArchive};
use serde::Serialize;
use serde_json::Value;

use crate::atomic::{read_file, read_json, sha256_hex, write_atomic, write_json_atomic};
use crate::backup::BackupManager;
use crate::error::Result;
use crate::version::{CURRENT_VERSION, VersionManager};

pub const ARCHIVE_SUFFIX: &str = ".state.bin";

/// `engine.json` -> `engine.json.state.bin`.
pub fn archive_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(ARCHIVE_SUFFIX);
    path.with_file_name(name)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SaveReport {
    pub path: PathBuf,
    pub archive_path: PathBuf,
    /// SHA-256 of the side-car, also recorded in the document metadata.
    pub archive_checksum: String,
    pub backups: Vec<PathBuf>,
    pub cache_entries: usize,
    pub memory_nodes: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadReport {
    pub path: PathBuf,
    pub source_version: String,
    pub migrated: bool,
    /// `None` when there was no side-car or no recorded checksum.
    pub checksum_ok: Option<bool>,
    pub cache_entries: usize,
    pub memory_nodes: usize,
}

pub trait EnginePersistence {
    /// Write the document and side-car atomically. With `backups`, the
    /// previous files (if any) are backed up before being replaced.
    fn save_state(&self, path: &Path, backups: Option<&BackupManager>) -> Result<SaveReport>;

    /// Load a document of any known version, migrating in memory when needed.
    /// The side-car is optional; a checksum mismatch is logged, not fatal.
    /// On error the engine keeps its previous state.
    fn load_state(&mut self, path: &Path) -> Result<LoadReport>;
}

impl EnginePersistence for ClassicalBridge {
    fn save_state(&self, path: &Path, backups: Option<&BackupManager>) -> Result<SaveReport> {
        let sidecar = archive_path(path);
        let mut backed_up = Vec::new();
        if let Some(manager) = backups {
            for existing in [path, sidecar.as_path()] {
                if existing.exists() {
                    let info = manager.create_backup(existing, Some("pre-save"), BTreeMap::new())?;
                    backed_up.push(info.path);
                }
            }
        }

        let archive = self.export_archive();
        let bytes = bincode::serialize(&archive)?;
        let checksum = sha256_hex(&bytes);
        write_atomic(&sidecar, &bytes)?;

        let doc = self.export_document(Some(checksum.clone()));
        write_json_atomic(path, &doc)?;
        tracing::debug!(
            "saved engine to {} ({} cached, {} nodes)",
            path.display(),
            doc.measurement_cache.len(),
            archive.memory_nodes.len()
        );

        Ok(SaveReport {
            path: path.to_path_buf(),
            archive_path: sidecar,
            archive_checksum: checksum,
            backups: backed_up,
            cache_entries: doc.measurement_cache.len(),
            memory_nodes: archive.memory_nodes.len(),
        })
    }

    fn load_state(&mut self, path: &Path) -> Result<LoadReport> {
        let raw: Value = read_json(path)?;
        let source_version = VersionManager::get_version(&raw);
        let migrated = source_version != CURRENT_VERSION;
        let value = if migrated {
            tracing::info!("loading {} as {source_version}, migrating in memory", path.display());
            VersionManager::new().migrate(&raw, CURRENT_VERSION)?
        } else {
            raw
        };
        let doc: EngineDocument = serde_json::from_value(value)?;
        let expected = doc.metadata.quantum_state_checksum.clone();
        let cache_entries = doc.measurement_cache.len();

        let sidecar = archive_path(path);
        let mut checksum_ok = None;
        let archive = if sidecar.exists() {
            let bytes = read_file(&sidecar)?;
            let actual = sha256_hex(&bytes);
            if let Some(expected) = &expected {
                let ok = *expected == actual;
                if !ok {
                    tracing::warn!(
                        "state archive {} checksum mismatch: expected {expected}, got {actual}",
                        sidecar.display()
                    );
                }
                checksum_ok = Some(ok);
            }
            Some(bincode::deserialize::<StateArchive>(&bytes)?)
        } else {
            tracing::debug!("no state archive beside {}", path.display());
            None
        };
        self.import_state(doc, archive)?;

        Ok(LoadReport {
            path: path.to_path_buf(),
            source_version,
            migrated,
            checksum_ok,
            cache_entries,
            memory_nodes: self.memory().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupConfig;
    use crate::version::legacy_sample;
    use affect_core::{AffectVector, BridgeConfig, NoiseConfig};

    fn bridge() -> ClassicalBridge {
        ClassicalBridge::new(BridgeConfig {
            n_qubits: 9,
            noise: NoiseConfig::ideal(),
            seed: Some(42),
            ..BridgeConfig::default()
        })
        .unwrap()
    }

    fn populated() -> ClassicalBridge {
        let mut b = bridge();
        for (p, a, d) in [(0.5, 0.6, 0.7), (-0.4, 0.2, 0.9), (0.1, 0.9, 0.1)] {
            let affect = AffectVector::new(p, a, d);
            let state = b.encode_classical_to_quantum(affect, true).unwrap();
            b.decode_quantum_to_classical(&state, 256).unwrap();
        }
        b
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let original = populated();
        let report = original.save_state(&path, None).unwrap();
        assert!(report.archive_path.exists());
        assert_eq!(report.memory_nodes, 3);

        let mut restored = bridge();
        let loaded = restored.load_state(&path).unwrap();
        assert!(!loaded.migrated);
        assert_eq!(loaded.checksum_ok, Some(true));
        assert_eq!(restored.memory().len(), 3);
        assert_eq!(restored.measurement_cache().len(), 3);
        assert_eq!(restored.context().encode_count, original.context().encode_count);
        assert!(restored.current_state().is_some());
    }

    #[test]
    fn test_checksum_mismatch_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        populated().save_state(&path, None).unwrap();

        let mut doc: Value = read_json(&path).unwrap();
        doc["metadata"]["quantum_state_checksum"] = Value::String("0".repeat(64));
        write_json_atomic(&path, &doc).unwrap();

        let mut restored = bridge();
        let loaded = restored.load_state(&path).unwrap();
        assert_eq!(loaded.checksum_ok, Some(false));
        assert_eq!(restored.memory().len(), 3);
    }

    #[test]
    fn test_resave_backs_up_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let backups = BackupManager::new(dir.path().join("backups"), BackupConfig::default()).unwrap();
        let b = populated();

        assert!(b.save_state(&path, Some(&backups)).unwrap().backups.is_empty());
        let second = b.save_state(&path, Some(&backups)).unwrap();
        assert_eq!(second.backups.len(), 2);
        assert!(backups.latest_for(&path).unwrap().is_some());
    }

    #[test]
    fn test_legacy_document_loads_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        write_json_atomic(&path, &legacy_sample(9, 2)).unwrap();

        let mut b = bridge();
        let loaded = b.load_state(&path).unwrap();
        assert_eq!(loaded.source_version, "1.0");
        assert!(loaded.migrated);
        assert_eq!(loaded.checksum_ok, None);
        assert_eq!(b.measurement_cache().len(), 2);
        // migration happens in memory only
        let on_disk: Value = read_json(&path).unwrap();
        assert_eq!(VersionManager::get_version(&on_disk), "1.0");
    }

    fn twelve_qubit_engine() -> ClassicalBridge {
        let mut b = ClassicalBridge::new(BridgeConfig {
            n_qubits: 12,
            noise: NoiseConfig::ideal(),
            seed: Some(7),
            ..BridgeConfig::default()
        })
        .unwrap();
        b.encode_classical_to_quantum(AffectVector::new(0.3, -0.2, 0.5), true).unwrap();
        b
    }

    #[test]
    fn test_truncated_sidecar_leaves_engine_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let report = populated().save_state(&path, None).unwrap();
        let bytes = std::fs::read(&report.archive_path).unwrap();
        std::fs::write(&report.archive_path, &bytes[..2]).unwrap();

        let mut target = twelve_qubit_engine();
        assert!(target.load_state(&path).is_err());
        assert_eq!(target.config().n_qubits, 12);
        assert_eq!(target.codec().n_qubits(), 12);
        assert_eq!(target.memory().len(), 1);
        assert_eq!(target.memory().nodes()[0].state.n_qubits(), 12);
        assert!(target.measurement_cache().is_empty());
    }

    #[test]
    fn test_corrupted_bond_in_sidecar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let report = populated().save_state(&path, None).unwrap();
        // current_state tag, site count, then site 0's left and right bonds
        let mut bytes = std::fs::read(&report.archive_path).unwrap();
        bytes[17] = 7;
        std::fs::write(&report.archive_path, &bytes).unwrap();

        let mut target = twelve_qubit_engine();
        assert!(target.load_state(&path).is_err());
        assert_eq!(target.config().n_qubits, 12);
        assert_eq!(target.memory().len(), 1);
    }

    #[test]
    fn test_legacy_document_drops_memories_of_another_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        write_json_atomic(&path, &legacy_sample(9, 2)).unwrap();

        let mut target = twelve_qubit_engine();
        target.load_state(&path).unwrap();
        assert_eq!(target.config().n_qubits, 9);
        assert!(target.memory().is_empty());
        assert!(target.current_state().is_none());

        let resaved = dir.path().join("resaved.json");
        assert_eq!(target.save_state(&resaved, None).unwrap().memory_nodes, 0);
    }
}
