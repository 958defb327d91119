//! Snapshot files on disk.

use crate::snapshot::{ExperimentSnapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding snapshot files
    pub storage_dir: PathBuf,
    /// Largest file accepted on load, in bytes (0 = unlimited)
    pub max_file_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".trialflow/experiments"),
            max_file_size: 64 * 1024 * 1024, // 64 MB, images are inlined as data URLs
        }
    }
}

impl StoreConfig {
    /// Use another directory
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Set the load size limit
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }
}

/// Write `snapshot` to `path` as indented JSON
///
/// # Errors
///
/// Returns error if serialization or the write fails
pub fn save_snapshot(path: impl AsRef<Path>, snapshot: &ExperimentSnapshot) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    let text = snapshot.to_json_pretty()?;
    std::fs::write(path, text).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), nodes = snapshot.nodes.len(), edges = snapshot.edges.len(), "snapshot saved");
    Ok(())
}

/// Read a snapshot file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not a snapshot of a
/// supported version
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<ExperimentSnapshot, SnapshotError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot = ExperimentSnapshot::from_json(&text)?;
    snapshot.check_version()?;
    tracing::debug!(path = %path.display(), version = %snapshot.version, "snapshot loaded");
    Ok(snapshot)
}

/// Directory of named snapshot files
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open the store, creating its directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if directory creation fails
    pub fn open(config: StoreConfig) -> Result<Self, SnapshotError> {
        std::fs::create_dir_all(&config.storage_dir).map_err(|source| SnapshotError::Io {
            path: config.storage_dir.clone(),
            source,
        })?;
        Ok(Self { config })
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Save under the file name derived from the snapshot's timestamp
    ///
    /// A snapshot saved the same day replaces the earlier file.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn save(&self, snapshot: &ExperimentSnapshot) -> Result<PathBuf, SnapshotError> {
        self.save_as(&snapshot.suggested_file_name(), snapshot)
    }

    /// Save under an explicit file name
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn save_as(&self, name: &str, snapshot: &ExperimentSnapshot) -> Result<PathBuf, SnapshotError> {
        let path = self.config.storage_dir.join(name);
        save_snapshot(&path, snapshot)?;
        Ok(path)
    }

    /// Load a snapshot by file name
    ///
    /// # Errors
    ///
    /// Returns error if no such file exists, it is over the size limit, or
    /// it does not parse
    pub fn load(&self, name: &str) -> Result<ExperimentSnapshot, SnapshotError> {
        let path = self.config.storage_dir.join(name);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound { name: name.to_string() });
            }
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };
        let limit = self.config.max_file_size;
        if limit > 0 && metadata.len() > limit {
            return Err(SnapshotError::TooLarge {
                size: metadata.len(),
                limit,
            });
        }
        load_snapshot(&path)
    }

    /// Check if a snapshot file exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.config.storage_dir.join(name).is_file()
    }

    /// Snapshot file names, sorted
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let dir = &self.config.storage_dir;
        let entries = std::fs::read_dir(dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete a snapshot file; returns false if it did not exist
    ///
    /// # Errors
    ///
    /// Returns error if removal fails
    pub fn delete(&self, name: &str) -> Result<bool, SnapshotError> {
        let path = self.config.storage_dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SnapshotError::Io { path, source }),
        }
    }
}
