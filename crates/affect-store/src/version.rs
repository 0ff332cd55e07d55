//! Schema versioning for persisted engine documents.
//!
//! Documents are handled as `serde_json::Value` so that any historical layout
//! can be read. Migrations are pure functions registered under
//! `"{from}_to_{to}"`; only one historical format (1.0) exists.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use affect_core::{
    CompressionMetrics, DOCUMENT_VERSION, EmotionalContext, FidelityMetrics, NoiseConfig,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::atomic::{read_json, write_json_atomic};
use crate::backup::BackupManager;
use crate::error::{Result, StoreError};

pub const CURRENT_VERSION: &str = DOCUMENT_VERSION;
pub const LEGACY_VERSION: &str = "1.0";

pub type MigrationFn = fn(&Value) -> Result<Value>;

/// Outcome of [`VersionManager::migrate_file`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationReport {
    pub path: PathBuf,
    pub from: String,
    pub to: String,
    pub migrated: bool,
    pub backup: Option<PathBuf>,
    pub cache_entries: usize,
}

pub struct VersionManager {
    migrations: HashMap<String, MigrationFn>,
}

impl Default for VersionManager {
    fn default() -> Self {
        let mut manager = Self {
            migrations: HashMap::new(),
        };
        manager.register(LEGACY_VERSION, CURRENT_VERSION, migrate_1_0_to_2_0);
        manager
    }
}

fn migration_key(from: &str, to: &str) -> String {
    format!("{from}_to_{to}")
}

fn version_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_f64().map(|f| format!("{f:.1}")),
        _ => None,
    }
}

/// Qubit count from either schema.
fn n_qubits(doc: &Value) -> Option<u64> {
    doc.pointer("/interface_config/n_qubits")
        .or_else(|| doc.pointer("/config/n_qubits"))
        .and_then(Value::as_u64)
}

fn cache_len(doc: &Value) -> usize {
    doc.get("measurement_cache")
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, from: &str, to: &str, migration: MigrationFn) {
        self.migrations.insert(migration_key(from, to), migration);
    }

    /// `metadata.version`, then legacy top-level `version`, else `"1.0"`.
    pub fn get_version(doc: &Value) -> String {
        doc.pointer("/metadata/version")
            .and_then(version_string)
            .or_else(|| doc.get("version").and_then(version_string))
            .unwrap_or_else(|| LEGACY_VERSION.to_string())
    }

    pub fn needs_migration(doc: &Value) -> bool {
        Self::get_version(doc) != CURRENT_VERSION
    }

    /// New document at `target`. The input is never modified; a document
    /// already at `target` comes back unchanged.
    pub fn migrate(&self, doc: &Value, target: &str) -> Result<Value> {
        let from = Self::get_version(doc);
        if from == target {
            return Ok(doc.clone());
        }
        let key = migration_key(&from, target);
        let migration = self
            .migrations
            .get(&key)
            .ok_or(StoreError::NoMigrationPath(key))?;
        tracing::info!("migrating document {from} -> {target}");
        migration(doc)
    }

    /// Problems found comparing a migrated document with its source; empty when valid.
    pub fn validate_migration(old: &Value, new: &Value, target: &str) -> Vec<String> {
        let mut problems = Vec::new();
        let (before, after) = (n_qubits(old), n_qubits(new));
        if before != after {
            problems.push(format!("n_qubits changed: {before:?} -> {after:?}"));
        }
        let (before, after) = (cache_len(old), cache_len(new));
        if before != after {
            problems.push(format!("measurement_cache length changed: {before} -> {after}"));
        }
        let version = Self::get_version(new);
        if version != target {
            problems.push(format!("version is {version}, expected {target}"));
        }
        problems
    }

    /// Migrate a document on disk in place.
    ///
    /// A pre-migration backup is taken when `backups` is given. If the
    /// migration fails or its result does not validate, the backup is restored
    /// over the file and `MigrationFailed` is returned.
    pub fn migrate_file(
        &self,
        path: &Path,
        target: &str,
        backups: Option<&BackupManager>,
    ) -> Result<MigrationReport> {
        let doc: Value = read_json(path)?;
        let from = Self::get_version(&doc);
        let mut report = MigrationReport {
            path: path.to_path_buf(),
            from: from.clone(),
            to: target.to_string(),
            migrated: false,
            backup: None,
            cache_entries: cache_len(&doc),
        };
        if from == target {
            return Ok(report);
        }

        let backup = backups
            .map(|b| {
                let metadata = BTreeMap::from([
                    ("from_version".to_string(), from.clone()),
                    ("to_version".to_string(), target.to_string()),
                ]);
                b.create_backup(path, Some("pre-migration"), metadata)
            })
            .transpose()?;
        report.backup = backup.as_ref().map(|b| b.path.clone());

        let outcome = self.migrate(&doc, target).and_then(|new| {
            let problems = Self::validate_migration(&doc, &new, target);
            if problems.is_empty() {
                Ok(new)
            } else {
                Err(StoreError::InvalidData(problems.join("; ")))
            }
        });

        match outcome {
            Ok(new) => {
                write_json_atomic(path, &new)?;
                report.migrated = true;
                report.cache_entries = cache_len(&new);
                tracing::info!("migrated {} from {from} to {target}", path.display());
                Ok(report)
            }
            Err(e) => {
                if let (Some(manager), Some(info)) = (backups, &backup) {
                    manager.restore_backup(&info.path, Some(path))?;
                    tracing::warn!("migration of {} rolled back from {}", path.display(), info.path.display());
                }
                Err(StoreError::MigrationFailed {
                    from,
                    to: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Legacy timestamps were either epoch seconds or naive ISO strings.
fn normalize_timestamp(v: Option<&Value>) -> Value {
    let parsed = match v {
        Some(Value::Number(n)) => n.as_f64().and_then(|secs| {
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        _ => None,
    };
    Value::String(parsed.unwrap_or_else(Utc::now).to_rfc3339())
}

fn to_value<T: Serialize>(v: &T) -> Result<Value> {
    Ok(serde_json::to_value(v)?)
}

fn migrate_1_0_to_2_0(doc: &Value) -> Result<Value> {
    let config = doc.get("config").cloned().unwrap_or(Value::Object(Map::new()));
    let n_qubits = config
        .get("n_qubits")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::InvalidData("legacy document has no config.n_qubits".into()))?;
    let device = config
        .get("device")
        .and_then(Value::as_str)
        .unwrap_or("cpu")
        .to_string();
    let error_mitigation = config
        .get("error_mitigation")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let empty = Vec::new();
    let legacy_cache = doc
        .get("measurement_cache")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let cache: Vec<Value> = legacy_cache
        .iter()
        .map(|entry| {
            let num = |key: &str, default: f64| entry.get(key).and_then(Value::as_f64).unwrap_or(default);
            json!({
                "state": {
                    "pleasure": num("pleasure", 0.0),
                    "arousal": num("arousal", 0.5),
                    "dominance": num("dominance", 0.5),
                    "confidence": num("confidence", 0.0),
                    "timestamp": normalize_timestamp(entry.get("timestamp")),
                    "fidelity": num("fidelity", 0.0),
                },
                "measurements": entry.get("counts").cloned().unwrap_or_else(|| json!({})),
            })
        })
        .collect();

    Ok(json!({
        "metadata": {
            "version": CURRENT_VERSION,
            "timestamp": normalize_timestamp(doc.get("timestamp")),
            "quantum_state_checksum": doc.get("quantum_state_checksum").cloned().unwrap_or(Value::Null),
            "device": device,
            "n_measurements_cached": cache.len(),
            "migrated_from": LEGACY_VERSION,
        },
        "interface_config": {
            "n_qubits": n_qubits,
            "device": device,
            "error_mitigation": error_mitigation,
            "noise_model": to_value(&NoiseConfig::default())?,
        },
        "measurement_cache": cache,
        "compression_metrics": to_value(&CompressionMetrics::default())?,
        "fidelity_metrics": to_value(&FidelityMetrics::default())?,
        "emotional_context": to_value(&EmotionalContext::default())?,
        "classical_network_state": Value::Null,
    }))
}

/// A minimal legacy document, useful for tests and fixtures.
pub fn legacy_sample(n_qubits: usize, entries: usize) -> Value {
    let cache: Vec<Value> = (0..entries)
        .map(|i| {
            let v = i as f64 / entries.max(1) as f64;
            json!({
                "pleasure": v * 2.0 - 1.0,
                "arousal": v,
                "dominance": 1.0 - v,
                "confidence": 0.9,
                "timestamp": 1_700_000_000.0 + i as f64,
                "fidelity": 0.95,
                "counts": {"0".repeat(n_qubits): 1024},
            })
        })
        .collect();
    json!({
        "version": LEGACY_VERSION,
        "timestamp": 1_700_000_000.5,
        "quantum_state_checksum": "deadbeef",
        "config": {"n_qubits": n_qubits, "device": "cpu", "error_mitigation": true},
        "measurement_cache": cache,
    })
}
