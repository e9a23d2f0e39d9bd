//! Durable election state: current term and the vote cast in it.
//!
//! This pair must hit disk before any vote is granted or any message is sent
//! acknowledging a term, otherwise a restart can re-cast a forgotten vote and
//! elect two leaders in one term.

use crate::error::{Result, StoreError};
use crate::record;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

const STATE_FILE: &str = "state";

/// The state that must survive a crash for elections to stay safe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term this node has seen.
    pub term: u64,
    /// Candidate this node voted for in `term`, if any.
    pub voted_for: Option<String>,
}

/// Atomic on-disk storage for [`HardState`].
#[derive(Debug)]
pub struct HardStateFile {
    path: PathBuf,
}

impl HardStateFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE),
        }
    }

    /// Loads the persisted state. Returns None when the file does not exist
    /// (a brand-new node). Corruption here is fatal: a vote we cannot read
    /// back is a vote we might re-cast.
    pub async fn load(&self) -> Result<Option<HardState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (payload, _) = record::decode_frame(&data).map_err(|e| StoreError::CorruptState {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let state = bincode::deserialize(&payload).map_err(|e| StoreError::CorruptState {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(state))
    }

    /// Persists the state durably: temp file, fsync, rename.
    pub async fn save(&self, state: &HardState) -> Result<()> {
        let frame = record::encode_frame(&bincode::serialize(state)?);
        let temp_path = self.path.with_extension("tmp");

        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        temp.write_all(&frame).await?;
        temp.sync_all().await?;
        drop(temp);

        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
