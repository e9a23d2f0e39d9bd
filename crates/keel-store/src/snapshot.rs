//! Durable snapshot storage.
//!
//! Each snapshot is a single file named `<last_index>-<last_term>.snap`
//! holding one checksummed frame. Writes go through a temp file + rename, so
//! a crash mid-save leaves the previous snapshot untouched. Only after a
//! snapshot is durable may the log be compacted past it.

use crate::error::{Result, StoreError};
use crate::record;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// A complete snapshot: the consensus position it covers plus the opaque
/// state machine bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    /// Index of the last entry folded into this snapshot.
    pub last_index: u64,
    /// Term of that entry.
    pub last_term: u64,
    /// Serialized application state.
    pub data: Bytes,
}

/// Manages the snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        // A crash during save can leave a temp file behind.
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                tracing::debug!(path = %path.display(), "removing stale temp file");
                tokio::fs::remove_file(&path).await?;
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persists a snapshot durably.
    pub async fn save(&self, blob: &SnapshotBlob) -> Result<()> {
        let path = self.snapshot_path(blob.last_index, blob.last_term);
        let frame = record::encode_frame(&bincode::serialize(blob)?);
        let temp_path = path.with_extension("tmp");

        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        temp.write_all(&frame).await?;
        temp.sync_all().await?;
        drop(temp);

        tokio::fs::rename(&temp_path, &path).await?;
        tracing::info!(
            last_index = blob.last_index,
            last_term = blob.last_term,
            bytes = frame.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Loads the most recent snapshot, or None if there is none.
    ///
    /// A snapshot that exists but cannot be read is fatal: the log below it
    /// is gone, so there is no way to rebuild the state it covered.
    pub async fn load_latest(&self) -> Result<Option<SnapshotBlob>> {
        let Some((last_index, last_term)) = self.latest_position().await? else {
            return Ok(None);
        };
        let path = self.snapshot_path(last_index, last_term);

        let data = tokio::fs::read(&path).await?;
        let (payload, _) = record::decode_frame(&data).map_err(|e| StoreError::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let blob: SnapshotBlob =
            bincode::deserialize(&payload).map_err(|e| StoreError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if blob.last_index != last_index || blob.last_term != last_term {
            return Err(StoreError::CorruptState {
                path,
                reason: format!(
                    "snapshot content ({}, {}) disagrees with file name",
                    blob.last_index, blob.last_term
                ),
            });
        }
        Ok(Some(blob))
    }

    /// Removes snapshots older than `last_index`. Returns how many were
    /// deleted.
    pub async fn prune_older_than(&self, last_index: u64) -> Result<u64> {
        let mut removed = 0u64;
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if let Some((index, _)) = parse_snapshot_name(&path) {
                if index < last_index {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn latest_position(&self) -> Result<Option<(u64, u64)>> {
        let mut latest: Option<(u64, u64)> = None;
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(position) = parse_snapshot_name(&entry.path()) {
                if latest.map_or(true, |best| position > best) {
                    latest = Some(position);
                }
            }
        }
        Ok(latest)
    }

    fn snapshot_path(&self, last_index: u64, last_term: u64) -> PathBuf {
        self.dir
            .join(format!("{:020}-{:020}.snap", last_index, last_term))
    }
}

fn parse_snapshot_name(path: &Path) -> Option<(u64, u64)> {
    if path.extension()?.to_str()? != "snap" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (index, term) = stem.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob(last_index: u64, last_term: u64, data: &str) -> SnapshotBlob {
        SnapshotBlob {
            last_index,
            last_term,
            data: Bytes::from(data.to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_directory_loads_none() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).await.unwrap();
        assert_eq!(store.load_latest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).await.unwrap();

        let snapshot = blob(42, 3, "machine-state");
        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load_latest().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_latest_wins() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).await.unwrap();

        store.save(&blob(10, 1, "old")).await.unwrap();
        store.save(&blob(50, 2, "newer")).await.unwrap();
        store.save(&blob(30, 2, "middle")).await.unwrap();

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.last_index, 50);
        assert_eq!(latest.data, Bytes::from_static(b"newer"));
    }

    #[tokio::test]
    async fn test_prune_older() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).await.unwrap();

        store.save(&blob(10, 1, "a")).await.unwrap();
        store.save(&blob(20, 1, "b")).await.unwrap();
        store.save(&blob(30, 2, "c")).await.unwrap();

        let removed = store.prune_older_than(30).await.unwrap();
        assert_eq!(removed, 2);

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.last_index, 30);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_fatal() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).await.unwrap();

        store.save(&blob(5, 1, "state")).await.unwrap();

        let path = temp.path().join(format!("{:020}-{:020}.snap", 5, 1));
        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 3] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            store.load_latest().await,
            Err(StoreError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_temp_file_cleaned_on_open() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("00000000000000000099-00000000000000000001.tmp"), b"junk")
            .unwrap();

        let store = SnapshotStore::open(temp.path()).await.unwrap();
        assert_eq!(store.load_latest().await.unwrap(), None);
        assert!(!temp
            .path()
            .join("00000000000000000099-00000000000000000001.tmp")
            .exists());
    }
}
