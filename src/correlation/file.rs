//! JSON snapshot files with atomic writes.
//!
//! Uses temp file + rename so a crash mid-write leaves the previous
//! snapshot intact.

use crate::SubwardenError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One JSON document on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Snapshot at `path`; the parent directory is created if missing.
    pub fn new(path: PathBuf) -> Result<Self, SubwardenError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SubwardenError::StateIO(format!("Failed to create dir: {}", e)))?;
        }
        Ok(Self { path })
    }

    /// Snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, `None` if it was never written.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SubwardenError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)
            .map_err(|e| SubwardenError::StateIO(format!("Failed to read snapshot: {}", e)))?;
        let value = serde_json::from_str(&json)
            .map_err(|e| SubwardenError::StateIO(format!("Failed to parse snapshot: {}", e)))?;
        Ok(Some(value))
    }

    /// Replace the snapshot atomically.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), SubwardenError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| SubwardenError::StateIO(format!("Failed to serialize: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .map_err(|e| SubwardenError::StateIO(format!("Failed to write temp file: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| SubwardenError::StateIO(format!("Failed to rename snapshot: {}", e)))?;

        Ok(())
    }
}
