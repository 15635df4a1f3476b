//! File-based snapshots
//!
//! Each snapshot is written twice: bincode for fast loading and JSON as a
//! readable backup. Loading prefers bincode and falls back to JSON. Writes
//! go to a temporary file first so a crash never leaves a torn snapshot.

use crate::{StorageError, StorageResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    /// Open (and create) a snapshot directory
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let data_dir = path.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        Ok(Self { data_dir })
    }

    fn bin_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.bin", name))
    }

    fn json_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", name))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn save<T: Serialize>(&self, name: &str, data: &T) -> StorageResult<()> {
        let bin = bincode::serialize(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.bin_path(name), &bin)?;

        let json = serde_json::to_vec_pretty(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.json_path(name), &json)?;

        debug!(snapshot = name, bytes = bin.len(), "Snapshot saved");
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> StorageResult<T> {
        let bin_path = self.bin_path(name);
        if bin_path.exists() {
            let data = fs::read(&bin_path)?;
            match bincode::deserialize(&data) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(snapshot = name, error = %e, "Binary snapshot unreadable, trying JSON");
                }
            }
        }

        let json_path = self.json_path(name);
        if json_path.exists() {
            let data = fs::read(&json_path)?;
            return serde_json::from_slice(&data)
                .map_err(|e| StorageError::Serialization(e.to_string()));
        }

        Err(StorageError::SnapshotNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.bin_path(name).exists() || self.json_path(name).exists()
    }

    /// Snapshot names, sorted
    pub fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "bin" || ext == "json");
            if !is_snapshot {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> StorageResult<()> {
        for path in [self.bin_path(name), self.json_path(name)] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Sample {
        sequence: u64,
        label: String,
    }

    fn sample(sequence: u64) -> Sample {
        Sample {
            sequence,
            label: format!("sample-{}", sequence),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path()).unwrap();

        snapshots.save("store", &sample(1)).unwrap();
        let loaded: Sample = snapshots.load("store").unwrap();
        assert_eq!(loaded, sample(1));

        snapshots.save("store", &sample(2)).unwrap();
        let loaded: Sample = snapshots.load("store").unwrap();
        assert_eq!(loaded.sequence, 2);
    }

    #[test]
    fn test_falls_back_to_json() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path()).unwrap();
        snapshots.save("store", &sample(3)).unwrap();

        fs::write(dir.path().join("store.bin"), b"\xff").unwrap();
        let loaded: Sample = snapshots.load("store").unwrap();
        assert_eq!(loaded, sample(3));
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path().join("nested")).unwrap();
        assert!(!snapshots.exists("store"));
        assert!(matches!(
            snapshots.load::<Sample>("store"),
            Err(StorageError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path()).unwrap();
        snapshots.save("trades", &sample(1)).unwrap();
        snapshots.save("store", &sample(2)).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(snapshots.list().unwrap(), vec!["store", "trades"]);

        snapshots.delete("store").unwrap();
        assert!(!snapshots.exists("store"));
        assert_eq!(snapshots.list().unwrap(), vec!["trades"]);
    }
}
