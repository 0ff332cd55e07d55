use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state archive error: {0}")]
    Archive(#[from] bincode::Error),

    #[error("invalid settings: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Core(#[from] affect_core::CoreError),

    /// Validation rejected the migrated document; the file was restored.
    #[error("migration {from} -> {to} failed: {reason}")]
    MigrationFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("no migration registered for {0}")]
    NoMigrationPath(String),

    /// Checkpoint file missing and no backup could replace it.
    #[error("checkpoint {0} is unrecoverable: file and backups missing")]
    UnrecoverableCheckpoint(String),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("corrupt backup {path}: {reason}")]
    CorruptBackup { path: PathBuf, reason: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("background worker: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
