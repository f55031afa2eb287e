//! Schema-versioned JSON files under the dispatcher's data directory.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::core::config::{DispatchConfigV1, SCHEMA_VERSION_V1};
use crate::dispatch::core::model::ProcessSnapshot;

pub const STORAGE_DIR_NAME: &str = "agv-dispatch";
pub const CONFIG_FILE_NAME: &str = "dispatch.v1.json";
pub const SNAPSHOTS_FILE_NAME: &str = "last_snapshots.v1.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schemaVersion: {0}")]
    UnsupportedSchemaVersion(u32),
}

/// Final snapshots of the processes seen by the last run; diagnostics only,
/// never used to resume work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsV1 {
    pub schema_version: u32,
    pub snapshots: Vec<ProcessSnapshot>,
}

pub fn dispatch_dir(app_data_dir: &Path) -> PathBuf {
    app_data_dir.join(STORAGE_DIR_NAME)
}

/// Files that carry a `schemaVersion` field.
trait Versioned {
    fn version(&self) -> u32;
}

impl Versioned for DispatchConfigV1 {
    fn version(&self) -> u32 {
        self.schema_version
    }
}

impl Versioned for SnapshotsV1 {
    fn version(&self) -> u32 {
        self.schema_version
    }
}

fn ensure_v1<T: Versioned>(payload: T) -> Result<T, StorageError> {
    match payload.version() {
        SCHEMA_VERSION_V1 => Ok(payload),
        other => Err(StorageError::UnsupportedSchemaVersion(other)),
    }
}

pub fn save_config(base_dir: &Path, config: &DispatchConfigV1) -> Result<(), StorageError> {
    if config.version() != SCHEMA_VERSION_V1 {
        return Err(StorageError::UnsupportedSchemaVersion(config.version()));
    }
    write_json_atomic(&base_dir.join(CONFIG_FILE_NAME), config)
}

pub fn load_config(base_dir: &Path) -> Result<Option<DispatchConfigV1>, StorageError> {
    read_json_optional::<DispatchConfigV1>(&base_dir.join(CONFIG_FILE_NAME))?
        .map(ensure_v1)
        .transpose()
}

pub fn save_snapshots(base_dir: &Path, snapshots: &[ProcessSnapshot]) -> Result<(), StorageError> {
    let file = SnapshotsV1 {
        schema_version: SCHEMA_VERSION_V1,
        snapshots: snapshots.to_vec(),
    };
    write_json_atomic(&base_dir.join(SNAPSHOTS_FILE_NAME), &file)
}

pub fn load_snapshots(base_dir: &Path) -> Result<Option<SnapshotsV1>, StorageError> {
    read_json_optional::<SnapshotsV1>(&base_dir.join(SNAPSHOTS_FILE_NAME))?
        .map(ensure_v1)
        .transpose()
}

/// Writes next to the target, then renames over it.
fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let staging = target.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&staging, body)?;
    if target.exists() {
        std::fs::remove_file(target)?;
    }
    std::fs::rename(&staging, target)?;
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(source: &Path) -> Result<Option<T>, StorageError> {
    match std::fs::read(source) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
