//! Progress snapshots for running and recently finished jobs.
//!
//! Every job owns one slot, keyed by job name. Each update rewrites the whole
//! mapping to the snapshot file (temp file + rename) while holding the write
//! lock, so concurrent jobs never clobber each other's slot and an external
//! reader never sees a half-written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::BackupState;
use crate::db::write_atomic;
use crate::error::Result;

pub type Snapshot = BTreeMap<String, BackupState>;

/// Shared store of the latest `BackupState` per job.
///
/// Cloning is cheap; clones share the same slots and snapshot file.
#[derive(Clone, Default)]
pub struct ProgressRecorder {
    inner: Arc<RwLock<Snapshot>>,
    snapshot_path: Option<Arc<PathBuf>>,
}

impl ProgressRecorder {
    /// A recorder that persists to `snapshot_path` on every write.
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            snapshot_path: Some(Arc::new(snapshot_path.into())),
        }
    }

    /// A recorder that keeps state in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref().map(PathBuf::as_path)
    }

    /// Store the latest state for its job and persist the full mapping.
    pub async fn update(&self, state: &BackupState) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert(state.name().to_string(), state.clone());
        self.persist(&map).await
    }

    /// Drop every slot for which `keep` returns false, then persist.
    ///
    /// `keep` runs under the write lock, so no update can land between the
    /// check and the removal.
    pub async fn retain(&self, mut keep: impl FnMut(&BackupState) -> bool) -> Result<()> {
        let mut map = self.inner.write().await;
        map.retain(|_, state| keep(state));
        self.persist(&map).await
    }

    pub async fn get(&self, name: &str) -> Option<BackupState> {
        let map = self.inner.read().await;
        map.get(name).cloned()
    }

    pub async fn get_all(&self) -> Snapshot {
        let map = self.inner.read().await;
        map.clone()
    }

    pub async fn len(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, map: &Snapshot) -> Result<()> {
        if let Some(path) = &self.snapshot_path {
            let json = serde_json::to_vec_pretty(map)?;
            write_atomic(path, &json).await?;
        }
        Ok(())
    }
}

/// Read a snapshot file written by a `ProgressRecorder`, possibly in another process.
///
/// A missing file reads as an empty snapshot.
pub async fn read_snapshot(path: &Path) -> Result<Snapshot> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::new()),
        Err(e) => Err(e.into()),
    }
}
