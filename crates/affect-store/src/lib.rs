//! Durable persistence for the affect engine: versioned documents with
//! migration, checksum-verified backups, checkpoints with rotation and an
//! optional background auto-checkpoint worker.

pub mod atomic;
pub mod auto;
pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod persist;
pub mod version;

pub use auto::AutoCheckpointer;
pub use backup::{BackupConfig, BackupInfo, BackupManager, BackupVerification};
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager, RestoreReport};
pub use config::{DATA_DIR_ENV, DataLayout, Settings};
pub use error::{Result, StoreError};
pub use persist::{EnginePersistence, LoadReport, SaveReport, archive_path};
pub use version::{CURRENT_VERSION, MigrationReport, VersionManager};
