//! Checksum-verified file backups with count/age rotation.
//!
//! Compressed payload layout:
//!
//! ```text
//! "AFBK" | uncompressed size (u64 LE) | compressed size (u64 LE) | gzip stream
//! ```
//!
//! Each backup has a `<backup>.meta.json` side-file recording the source path
//! and the SHA-256 of the original content.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic::{read_file, read_json, sha256_hex, write_atomic, write_json_atomic};
use crate::error::{Result, StoreError};

pub const MAGIC: &[u8; 4] = b"AFBK";
const HEADER_LEN: usize = 20;
const META_SUFFIX: &str = ".meta.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backups: usize,
    /// Zero or less turns age rotation off.
    pub max_age_days: i64,
    pub compress: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: 10,
            max_age_days: 30,
            compress: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub source_path: PathBuf,
    /// SHA-256 of the original (uncompressed) content.
    pub checksum: String,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    pub original_size: u64,
    pub stored_size: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackupVerification {
    pub path: PathBuf,
    pub exists: bool,
    pub metadata_present: bool,
    pub readable: bool,
    pub checksum_ok: bool,
    pub error: Option<String>,
}

impl BackupVerification {
    pub fn is_valid(&self) -> bool {
        self.exists && self.metadata_present && self.readable && self.checksum_ok
    }
}

fn meta_path(backup: &Path) -> PathBuf {
    let mut name = backup.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(META_SUFFIX);
    backup.with_file_name(name)
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn compress(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content)
        .and_then(|_| encoder.finish())
        .map(|gz| {
            let mut out = Vec::with_capacity(HEADER_LEN + gz.len());
            out.extend_from_slice(MAGIC);
            out.extend_from_slice(&(content.len() as u64).to_le_bytes());
            out.extend_from_slice(&(gz.len() as u64).to_le_bytes());
            out.extend_from_slice(&gz);
            out
        })
        .map_err(|e| StoreError::InvalidData(format!("compression failed: {e}")))
}

fn decompress(bytes: &[u8], path: &Path) -> Result<Vec<u8>> {
    let corrupt = |reason: String| StoreError::CorruptBackup {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(corrupt("missing AFBK header".into()));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[4..12]);
    let uncompressed = u64::from_le_bytes(word);
    word.copy_from_slice(&bytes[12..20]);
    let compressed = u64::from_le_bytes(word);

    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != compressed {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {compressed}",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(uncompressed as usize);
    GzDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(format!("gzip: {e}")))?;
    if out.len() as u64 != uncompressed {
        return Err(corrupt(format!(
            "inflated to {} bytes, header says {uncompressed}",
            out.len()
        )));
    }
    Ok(out)
}

pub struct BackupManager {
    dir: PathBuf,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, config: BackupConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, config })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Copy `source` into the backup directory, then rotate.
    pub fn create_backup(
        &self,
        source: &Path,
        name: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<BackupInfo> {
        let content = read_file(source)?;
        let checksum = sha256_hex(&content);
        let created_at = Utc::now();

        let label = name
            .map(sanitize)
            .or_else(|| source.file_name().map(|n| sanitize(&n.to_string_lossy())))
            .unwrap_or_else(|| "backup".into());
        let unique = Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{label}-{}-{}.bak",
            created_at.format("%Y%m%dT%H%M%S%.6fZ"),
            &unique[..8]
        );
        let path = self.dir.join(file_name);

        let stored = if self.config.compress {
            compress(&content)?
        } else {
            content.clone()
        };
        write_atomic(&path, &stored)?;

        let info = BackupInfo {
            path: path.clone(),
            source_path: source.to_path_buf(),
            checksum,
            compressed: self.config.compress,
            created_at,
            original_size: content.len() as u64,
            stored_size: stored.len() as u64,
            name: name.map(str::to_string),
            metadata,
        };
        write_json_atomic(&meta_path(&path), &info)?;
        tracing::info!(
            "backup {} created from {} ({} -> {} bytes)",
            path.display(),
            source.display(),
            info.original_size,
            info.stored_size
        );

        self.rotate()?;
        Ok(info)
    }

    pub fn read_info(&self, backup: &Path) -> Result<BackupInfo> {
        let meta = meta_path(backup);
        if !meta.exists() {
            return Err(StoreError::CorruptBackup {
                path: backup.to_path_buf(),
                reason: "metadata side-file missing".into(),
            });
        }
        read_json(&meta)
    }

    /// Original bytes of a backup, checksum-verified.
    fn load_verified(&self, info: &BackupInfo) -> Result<Vec<u8>> {
        let stored = read_file(&info.path)?;
        let content = if info.compressed {
            decompress(&stored, &info.path)?
        } else {
            stored
        };
        let actual = sha256_hex(&content);
        if actual != info.checksum {
            return Err(StoreError::ChecksumMismatch {
                path: info.path.clone(),
                expected: info.checksum.clone(),
                actual,
            });
        }
        Ok(content)
    }

    /// Write the backed-up content to `target`, or to the recorded source path.
    /// The target is left untouched if the backup fails verification.
    pub fn restore_backup(&self, backup: &Path, target: Option<&Path>) -> Result<PathBuf> {
        let info = self.read_info(backup)?;
        let content = self.load_verified(&info)?;
        let target = target.map(Path::to_path_buf).unwrap_or(info.source_path);
        write_atomic(&target, &content)?;
        tracing::info!("restored {} -> {}", backup.display(), target.display());
        Ok(target)
    }

    pub fn verify_backup(&self, backup: &Path) -> BackupVerification {
        let mut report = BackupVerification {
            path: backup.to_path_buf(),
            exists: backup.exists(),
            ..BackupVerification::default()
        };
        if !report.exists {
            report.error = Some("backup file missing".into());
            return report;
        }
        let info = match self.read_info(backup) {
            Ok(info) => info,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.metadata_present = true;
        match self.load_verified(&info) {
            Ok(_) => {
                report.readable = true;
                report.checksum_ok = true;
            }
            Err(e @ StoreError::ChecksumMismatch { .. }) => {
                report.readable = true;
                report.error = Some(e.to_string());
            }
            Err(e) => report.error = Some(e.to_string()),
        }
        report
    }

    /// All backups with readable metadata, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();
            let is_meta = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(META_SUFFIX));
            if !is_meta {
                continue;
            }
            match read_json::<BackupInfo>(&path) {
                Ok(info) => out.push(info),
                Err(e) => tracing::warn!("skipping unreadable backup metadata {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.path.cmp(&b.path)));
        Ok(out)
    }

    /// Most recent backup of `source`.
    pub fn latest_for(&self, source: &Path) -> Result<Option<BackupInfo>> {
        Ok(self
            .list_backups()?
            .into_iter()
            .filter(|b| b.source_path == source)
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    pub fn delete_backup(&self, backup: &Path) -> Result<()> {
        for path in [backup.to_path_buf(), meta_path(backup)] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        Ok(())
    }

    pub fn rotate(&self) -> Result<Vec<PathBuf>> {
        self.rotate_at(Utc::now())
    }

    /// Drop backups older than `max_age_days`, then the oldest beyond `max_backups`.
    pub fn rotate_at(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let max_age = (self.config.max_age_days > 0).then(|| Duration::days(self.config.max_age_days));
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for info in self.list_backups()? {
            if max_age.is_some_and(|age| now - info.created_at > age) {
                tracing::info!(
                    "rotating backup {} (reason: age, created {})",
                    info.path.display(),
                    info.created_at
                );
                self.delete_backup(&info.path)?;
                removed.push(info.path);
            } else {
                kept.push(info);
            }
        }
        let excess = kept.len().saturating_sub(self.config.max_backups);
        for info in kept.into_iter().take(excess) {
            tracing::info!(
                "rotating backup {} (reason: count, limit {})",
                info.path.display(),
                self.config.max_backups
            );
            self.delete_backup(&info.path)?;
            removed.push(info.path);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path, config: BackupConfig) -> BackupManager {
        BackupManager::new(dir.join("backups"), config).unwrap()
    }

    fn source(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("engine.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_uncompressed_restore_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(
            dir.path(),
            BackupConfig {
                compress: false,
                ..BackupConfig::default()
            },
        );
        let content = br#"{"metadata": {"version": "2.0"}}"#;
        let src = source(dir.path(), content);
        let info = backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        assert!(!info.compressed);

        let target = dir.path().join("restored.json");
        backups.restore_backup(&info.path, Some(&target)).unwrap();
        assert_eq!(fs::read(&target).unwrap(), content);
        assert_eq!(crate::atomic::file_checksum(&target).unwrap(), info.checksum);
    }

    #[test]
    fn test_compressed_backup_has_header_and_restores_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(dir.path(), BackupConfig::default());
        let content = "affect ".repeat(500);
        let src = source(dir.path(), content.as_bytes());
        let info = backups.create_backup(&src, Some("nightly"), BTreeMap::new()).unwrap();

        let stored = fs::read(&info.path).unwrap();
        assert_eq!(&stored[..4], MAGIC);
        assert_eq!(u64::from_le_bytes(stored[4..12].try_into().unwrap()), content.len() as u64);
        assert!(info.stored_size < info.original_size);

        fs::write(&src, b"overwritten").unwrap();
        let restored = backups.restore_backup(&info.path, None).unwrap();
        assert_eq!(restored, src);
        assert_eq!(fs::read_to_string(&src).unwrap(), content);
    }

    #[test]
    fn test_corrupted_backup_fails_without_touching_target() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(
            dir.path(),
            BackupConfig {
                compress: false,
                ..BackupConfig::default()
            },
        );
        let src = source(dir.path(), b"precious bytes");
        let info = backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        fs::write(&info.path, b"precious bytez").unwrap();

        let target = dir.path().join("target.json");
        fs::write(&target, b"keep me").unwrap();
        let result = backups.restore_backup(&info.path, Some(&target));
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
        assert_eq!(fs::read(&target).unwrap(), b"keep me");

        let report = backups.verify_backup(&info.path);
        assert!(report.readable);
        assert!(!report.checksum_ok);
        assert!(!report.is_valid());
    }

    #[test]
    fn test_truncated_compressed_backup_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(dir.path(), BackupConfig::default());
        let src = source(dir.path(), "data ".repeat(100).as_bytes());
        let info = backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        let stored = fs::read(&info.path).unwrap();
        fs::write(&info.path, &stored[..stored.len() - 5]).unwrap();

        let report = backups.verify_backup(&info.path);
        assert!(!report.readable);
        assert!(matches!(
            backups.restore_backup(&info.path, None),
            Err(StoreError::CorruptBackup { .. })
        ));
    }

    #[test]
    fn test_verify_reports_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(dir.path(), BackupConfig::default());
        let missing = backups.verify_backup(&dir.path().join("nope.bak"));
        assert!(!missing.exists);

        let orphan = backups.dir().join("orphan.bak");
        fs::write(&orphan, b"x").unwrap();
        let report = backups.verify_backup(&orphan);
        assert!(report.exists);
        assert!(!report.metadata_present);

        let src = source(dir.path(), b"ok");
        let info = backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        assert!(backups.verify_backup(&info.path).is_valid());
    }

    #[test]
    fn test_rotation_by_count_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(
            dir.path(),
            BackupConfig {
                max_backups: 3,
                ..BackupConfig::default()
            },
        );
        let src = source(dir.path(), b"v");
        let mut created = Vec::new();
        for i in 0..5 {
            fs::write(&src, format!("version {i}")).unwrap();
            created.push(backups.create_backup(&src, None, BTreeMap::new()).unwrap());
        }
        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 3);
        let kept: Vec<_> = listed.iter().map(|b| b.checksum.clone()).collect();
        let newest: Vec<_> = created[2..].iter().map(|b| b.checksum.clone()).collect();
        assert_eq!(kept, newest);
        assert!(!created[0].path.exists());
        assert_eq!(backups.latest_for(&src).unwrap().unwrap().checksum, created[4].checksum);
    }

    #[test]
    fn test_rotation_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(dir.path(), BackupConfig::default());
        let src = source(dir.path(), b"old");
        backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        assert!(backups.rotate_at(Utc::now() + Duration::days(29)).unwrap().is_empty());
        let removed = backups.rotate_at(Utc::now() + Duration::days(31)).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(backups.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_zero_max_age_never_ages_out() {
        let dir = tempfile::tempdir().unwrap();
        let backups = manager(
            dir.path(),
            BackupConfig {
                max_age_days: 0,
                ..BackupConfig::default()
            },
        );
        let src = source(dir.path(), b"kept");
        backups.create_backup(&src, None, BTreeMap::new()).unwrap();
        assert!(backups.rotate_at(Utc::now() + Duration::days(3650)).unwrap().is_empty());
        assert_eq!(backups.list_backups().unwrap().len(), 1);
    }
}
