//! Named, hashed snapshots of the whole engine with a persisted registry.
//!
//! Each checkpoint is an engine document (`<id>.json`) plus its state
//! side-car, both backed up on creation into the checkpoint directory's own
//! `backups/` pool. That pool holds two backups per registered checkpoint and
//! never ages out; a checkpoint's backups go when the checkpoint does. The
//! registry (`registry.json`) is rewritten atomically on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use affect_core::ClassicalBridge;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic::{file_checksum, read_json, write_json_atomic};
use crate::backup::{BackupConfig, BackupManager};
use crate::error::{Result, StoreError};
use crate::persist::{EnginePersistence, LoadReport, archive_path};

const REGISTRY_FILE: &str = "registry.json";
const BACKUP_DIR: &str = "backups";
const CHECKPOINT_ID_KEY: &str = "checkpoint_id";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub max_checkpoints: usize,
    pub auto_interval_secs: u64,
    pub join_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 10,
            auto_interval_secs: 300,
            join_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub description: String,
    /// SHA-256 of the checkpoint document.
    pub state_hash: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub is_auto: bool,
}

impl Checkpoint {
    /// A registered checkpoint only counts while its document exists.
    pub fn is_valid(&self) -> bool {
        self.file_path.exists()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Registry {
    checkpoints: BTreeMap<String, Checkpoint>,
    current_checkpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RestoreReport {
    pub checkpoint: Checkpoint,
    /// Files that had to be recovered from backups first.
    pub recovered: Vec<PathBuf>,
    pub hash_ok: bool,
    pub load: LoadReport,
}

pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointConfig,
    backups: BackupManager,
    registry: Registry,
}

impl CheckpointManager {
    /// Open (or create) the checkpoint directory, its registry and its backup pool.
    pub fn open(dir: impl Into<PathBuf>, config: CheckpointConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        // room for every registered checkpoint plus the one being created
        let pool = BackupConfig {
            max_backups: 2 * (config.max_checkpoints.max(1) + 1),
            max_age_days: 0,
            ..BackupConfig::default()
        };
        let backups = BackupManager::new(dir.join(BACKUP_DIR), pool)?;
        let registry_path = dir.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            read_json(&registry_path)?
        } else {
            Registry::default()
        };
        Ok(Self {
            dir,
            config,
            backups,
            registry,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn len(&self) -> usize {
        self.registry.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.checkpoints.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.registry.checkpoints.get(id)
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.registry
            .current_checkpoint
            .as_deref()
            .and_then(|id| self.registry.checkpoints.get(id))
    }

    /// Oldest first.
    pub fn list_checkpoints(&self) -> Vec<&Checkpoint> {
        let mut all: Vec<&Checkpoint> = self.registry.checkpoints.values().collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        all
    }

    fn save_registry(&self) -> Result<()> {
        write_json_atomic(&self.dir.join(REGISTRY_FILE), &self.registry)
    }

    /// Snapshot the engine, register it as current, back it up, then rotate.
    pub fn create_checkpoint(
        &mut self,
        engine: &ClassicalBridge,
        name: Option<&str>,
        description: &str,
        is_auto: bool,
    ) -> Result<Checkpoint> {
        let timestamp = Utc::now();
        let unique = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", timestamp.format("%Y%m%dT%H%M%S%.6fZ"), &unique[..8]);
        let file_path = self.dir.join(format!("{id}.json"));

        let saved = engine.save_state(&file_path, None)?;
        let state_hash = file_checksum(&file_path)?;
        let metadata = BTreeMap::from([
            ("n_qubits".to_string(), engine.config().n_qubits.to_string()),
            ("cache_entries".to_string(), saved.cache_entries.to_string()),
            ("memory_nodes".to_string(), saved.memory_nodes.to_string()),
            ("encode_count".to_string(), engine.context().encode_count.to_string()),
        ]);
        let default_name = if is_auto { "auto" } else { "checkpoint" };
        let checkpoint = Checkpoint {
            id: id.clone(),
            timestamp,
            name: name.unwrap_or(default_name).to_string(),
            description: description.to_string(),
            state_hash,
            file_path: file_path.clone(),
            metadata,
            is_auto,
        };

        self.registry.checkpoints.insert(id.clone(), checkpoint.clone());
        self.registry.current_checkpoint = Some(id.clone());
        self.save_registry()?;

        let backup_meta = BTreeMap::from([(CHECKPOINT_ID_KEY.to_string(), id.clone())]);
        for file in [file_path.as_path(), saved.archive_path.as_path()] {
            self.backups.create_backup(file, Some(&id), backup_meta.clone())?;
        }

        tracing::info!(
            "checkpoint {id} created ({}, {})",
            checkpoint.name,
            if is_auto { "auto" } else { "manual" }
        );
        self.rotate()?;
        Ok(checkpoint)
    }

    /// Evict down to `max_checkpoints`. The current checkpoint is never
    /// evicted; automatic checkpoints go before manual ones, oldest first.
    pub fn rotate(&mut self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        while self.registry.checkpoints.len() > self.config.max_checkpoints {
            let current = self.registry.current_checkpoint.as_deref();
            let candidates: Vec<&Checkpoint> = self
                .list_checkpoints()
                .into_iter()
                .filter(|c| Some(c.id.as_str()) != current)
                .collect();
            let (victim, reason) = match candidates.iter().find(|c| c.is_auto) {
                Some(auto) => (auto.id.clone(), "auto-first"),
                None => match candidates.first() {
                    Some(manual) => (manual.id.clone(), "oldest-manual"),
                    None => break,
                },
            };
            tracing::info!("rotating checkpoint {victim} (reason: {reason})");
            self.remove_entry(&victim)?;
            removed.push(victim);
        }
        if !removed.is_empty() {
            self.save_registry()?;
        }
        Ok(removed)
    }

    fn remove_entry(&mut self, id: &str) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.registry.checkpoints.remove(id) else {
            return Ok(None);
        };
        for path in [checkpoint.file_path.clone(), archive_path(&checkpoint.file_path)] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        for info in self.backups.list_backups()? {
            if info.metadata.get(CHECKPOINT_ID_KEY).map(String::as_str) == Some(id) {
                self.backups.delete_backup(&info.path)?;
            }
        }
        if self.registry.current_checkpoint.as_deref() == Some(id) {
            self.registry.current_checkpoint = None;
        }
        Ok(Some(checkpoint))
    }

    /// Remove a checkpoint together with its files and backups.
    pub fn delete_checkpoint(&mut self, id: &str) -> Result<Checkpoint> {
        let checkpoint = self
            .remove_entry(id)?
            .ok_or_else(|| StoreError::CheckpointNotFound(id.to_string()))?;
        self.save_registry()?;
        tracing::info!("checkpoint {id} deleted");
        Ok(checkpoint)
    }

    /// Load a checkpoint into `engine` and make it current.
    ///
    /// A missing document (or side-car) is first recovered from its latest
    /// backup; a missing document with no backup is `UnrecoverableCheckpoint`.
    pub fn restore_checkpoint(&mut self, engine: &mut ClassicalBridge, id: &str) -> Result<RestoreReport> {
        let checkpoint = self
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::CheckpointNotFound(id.to_string()))?;

        let mut recovered = Vec::new();
        if !checkpoint.is_valid() {
            let backup = self
                .backups
                .latest_for(&checkpoint.file_path)?
                .ok_or_else(|| StoreError::UnrecoverableCheckpoint(id.to_string()))?;
            tracing::warn!("checkpoint {id} file missing, restoring from {}", backup.path.display());
            self.backups.restore_backup(&backup.path, Some(&checkpoint.file_path))?;
            recovered.push(checkpoint.file_path.clone());
        }
        let sidecar = archive_path(&checkpoint.file_path);
        if !sidecar.exists() {
            match self.backups.latest_for(&sidecar)? {
                Some(backup) => {
                    self.backups.restore_backup(&backup.path, Some(&sidecar))?;
                    recovered.push(sidecar);
                }
                None => tracing::warn!("checkpoint {id} has no state archive; memory nodes not restored"),
            }
        }

        let hash_ok = file_checksum(&checkpoint.file_path)? == checkpoint.state_hash;
        if !hash_ok {
            tracing::warn!("checkpoint {id} document does not match its recorded hash");
        }

        let load = engine.load_state(&checkpoint.file_path)?;
        self.registry.current_checkpoint = Some(id.to_string());
        self.save_registry()?;
        tracing::info!("restored checkpoint {id}");

        Ok(RestoreReport {
            checkpoint,
            recovered,
            hash_ok,
            load,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn manager(dir: &Path, max_checkpoints: usize) -> CheckpointManager {
        CheckpointManager::open(
            dir.join("checkpoints"),
            CheckpointConfig {
                max_checkpoints,
                ..CheckpointConfig::default()
            },
        )
        .unwrap()
    }

    fn backed_up_ids(m: &CheckpointManager) -> Vec<String> {
        let mut ids: Vec<String> = m
            .backups()
            .list_backups()
            .unwrap()
            .into_iter()
            .filter_map(|b| b.metadata.get(CHECKPOINT_ID_KEY).cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    #[test]
    fn test_create_registers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = bridge();
        engine.encode_classical_to_quantum(AffectVector::new(0.2, 0.4, 0.6), true).unwrap();

        let id = {
            let mut m = manager(dir.path(), 5);
            let cp = m.create_checkpoint(&engine, Some("first"), "after one encode", false).unwrap();
            assert!(cp.is_valid());
            assert_eq!(cp.state_hash, file_checksum(&cp.file_path).unwrap());
            assert_eq!(m.current().map(|c| c.id.clone()), Some(cp.id.clone()));
            assert_eq!(m.backups().list_backups().unwrap().len(), 2);
            cp.id
        };

        let reopened = manager(dir.path(), 5);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.current().unwrap().id, id);
        assert_eq!(reopened.get(&id).unwrap().name, "first");
    }

    #[test]
    fn test_rotation_prefers_auto_and_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let engine = bridge();
        let mut m = manager(dir.path(), 3);

        let m1 = m.create_checkpoint(&engine, Some("m1"), "", false).unwrap().id;
        let a1 = m.create_checkpoint(&engine, None, "", true).unwrap().id;
        let a2 = m.create_checkpoint(&engine, None, "", true).unwrap().id;
        let m2 = m.create_checkpoint(&engine, Some("m2"), "", false).unwrap().id;
        assert!(m.get(&a1).is_none());
        assert!(m.get(&a2).is_some());

        let a3 = m.create_checkpoint(&engine, None, "", true).unwrap().id;
        assert!(m.get(&a2).is_none());
        assert!(m.get(&a3).is_some(), "current auto checkpoint is exempt");

        let m3 = m.create_checkpoint(&engine, Some("m3"), "", false).unwrap().id;
        assert!(m.get(&a3).is_none());
        let m4 = m.create_checkpoint(&engine, Some("m4"), "", false).unwrap().id;

        let ids: Vec<&str> = m.list_checkpoints().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![m2.as_str(), m3.as_str(), m4.as_str()]);
        assert!(!dir.path().join("checkpoints").join(format!("{m1}.json")).exists());
        assert_eq!(m.current().unwrap().id, m4);
    }

    #[test]
    fn test_restore_brings_engine_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = bridge();
        let mut m = manager(dir.path(), 5);
        engine.encode_classical_to_quantum(AffectVector::new(0.7, 0.7, 0.7), true).unwrap();
        let cp = m.create_checkpoint(&engine, None, "", false).unwrap();
        engine.encode_classical_to_quantum(AffectVector::new(-0.7, 0.1, 0.1), true).unwrap();
        m.create_checkpoint(&engine, None, "", false).unwrap();
        assert_eq!(engine.memory().len(), 2);

        let report = m.restore_checkpoint(&mut engine, &cp.id).unwrap();
        assert!(report.recovered.is_empty());
        assert!(report.hash_ok);
        assert_eq!(engine.memory().len(), 1);
        assert_eq!(m.current().unwrap().id, cp.id);
    }

    #[test]
    fn test_restore_recovers_missing_file_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = bridge();
        let mut m = manager(dir.path(), 5);
        engine.encode_classical_to_quantum(AffectVector::new(0.3, 0.3, 0.3), true).unwrap();
        let cp = m.create_checkpoint(&engine, None, "", false).unwrap();
        fs::remove_file(&cp.file_path).unwrap();
        fs::remove_file(archive_path(&cp.file_path)).unwrap();
        assert!(!m.get(&cp.id).unwrap().is_valid());

        let mut fresh = bridge();
        let report = m.restore_checkpoint(&mut fresh, &cp.id).unwrap();
        assert_eq!(report.recovered.len(), 2);
        assert!(report.hash_ok);
        assert_eq!(fresh.memory().len(), 1);
    }

    #[test]
    fn test_missing_file_without_backup_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = bridge();
        let mut m = manager(dir.path(), 5);
        let cp = m.create_checkpoint(&engine, None, "", false).unwrap();
        for info in m.backups().list_backups().unwrap() {
            m.backups().delete_backup(&info.path).unwrap();
        }
        fs::remove_file(&cp.file_path).unwrap();

        let result = m.restore_checkpoint(&mut engine, &cp.id);
        assert!(matches!(result, Err(StoreError::UnrecoverableCheckpoint(id)) if id == cp.id));
        assert!(matches!(
            m.restore_checkpoint(&mut engine, "nope"),
            Err(StoreError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn test_delete_clears_current() {
        let dir = tempfile::tempdir().unwrap();
        let engine = bridge();
        let mut m = manager(dir.path(), 5);
        let cp = m.create_checkpoint(&engine, None, "", false).unwrap();
        m.delete_checkpoint(&cp.id).unwrap();
        assert!(m.is_empty());
        assert!(m.current().is_none());
        assert!(!cp.file_path.exists());
        assert!(matches!(m.delete_checkpoint(&cp.id), Err(StoreError::CheckpointNotFound(_))));
    }

    #[test]
    fn test_every_checkpoint_stays_recoverable_at_default_limits() {
        let dir = tempfile::tempdir().unwrap();
        let user_backups = BackupManager::new(dir.path().join("backups"), BackupConfig::default()).unwrap();
        let mut m = CheckpointManager::open(dir.path().join("checkpoints"), CheckpointConfig::default()).unwrap();
        let mut engine = bridge();
        let mut ids = Vec::new();
        for i in 0..10 {
            let v = i as f64 / 10.0;
            engine.encode_classical_to_quantum(AffectVector::new(v, 0.5, 0.5), true).unwrap();
            ids.push(m.create_checkpoint(&engine, None, "", false).unwrap().id);
        }
        assert_eq!(m.len(), 10);
        assert_eq!(m.backups().list_backups().unwrap().len(), 20);
        assert!(user_backups.list_backups().unwrap().is_empty());

        let oldest = m.get(&ids[0]).cloned().unwrap();
        fs::remove_file(&oldest.file_path).unwrap();
        let mut fresh = bridge();
        let report = m.restore_checkpoint(&mut fresh, &oldest.id).unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert!(report.hash_ok);
        assert_eq!(fresh.memory().len(), 1);
    }

    #[test]
    fn test_rotated_checkpoints_take_their_backups_along() {
        let dir = tempfile::tempdir().unwrap();
        let engine = bridge();
        let mut m = manager(dir.path(), 2);
        let first = m.create_checkpoint(&engine, None, "", false).unwrap().id;
        let second = m.create_checkpoint(&engine, None, "", false).unwrap().id;
        let third = m.create_checkpoint(&engine, None, "", false).unwrap().id;

        assert!(m.get(&first).is_none());
        let mut expected = vec![second.clone(), third];
        expected.sort();
        assert_eq!(backed_up_ids(&m), expected);
        assert_eq!(m.backups().list_backups().unwrap().len(), 4);

        m.delete_checkpoint(&second).unwrap();
        assert!(!backed_up_ids(&m).contains(&second));
        assert_eq!(m.backups().list_backups().unwrap().len(), 2);
    }
}
