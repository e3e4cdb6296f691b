use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SnapshotConfig;
use crate::error::{RaftError, Result};
use crate::snapshot::storage::{FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage};
use crate::snapshot::{Snapshot, SnapshotMetadata};

/// Creates, retains and looks up snapshots on top of a [`SnapshotStorage`].
///
/// Snapshot indexes strictly increase; once more than `retain` snapshots
/// exist the oldest ones are deleted.
pub struct SnapshotManager {
    storage: Arc<dyn SnapshotStorage>,
    retain: usize,
    /// Oldest first.
    retained: Mutex<Vec<SnapshotMetadata>>,
    /// Snapshot taken from the leader that storage has not accepted yet.
    installed: Mutex<Option<Snapshot>>,
}

impl SnapshotManager {
    pub fn new(storage: Arc<dyn SnapshotStorage>, retain: usize) -> Self {
        Self {
            storage,
            retain: retain.max(1),
            retained: Mutex::new(Vec::new()),
            installed: Mutex::new(None),
        }
    }

    /// File-backed when a directory is configured, in-memory otherwise.
    pub fn from_config(config: &SnapshotConfig) -> Self {
        let storage: Arc<dyn SnapshotStorage> = match &config.dir {
            Some(dir) => Arc::new(FileSnapshotStorage::new(dir.clone(), config.compress)),
            None => Arc::new(MemorySnapshotStorage::new()),
        };
        Self::new(storage, config.retain)
    }

    /// Index the existing snapshots and load the newest one.
    ///
    /// Any failure here maps to [`RaftError::SnapshotLoad`]: a node that
    /// cannot read its own checkpoint must not join the cluster.
    pub async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let stored = self
            .storage
            .list()
            .await
            .map_err(|e| RaftError::SnapshotLoad(e.to_string()))?;

        let latest = match stored.last() {
            Some(meta) => Some(
                self.storage
                    .load(meta)
                    .await
                    .map_err(|e| RaftError::SnapshotLoad(e.to_string()))?,
            ),
            None => None,
        };

        *self.retained.lock().await = stored;
        Ok(latest)
    }

    /// Persist a snapshot covering the log through `index`.
    ///
    /// Fails with [`RaftError::StaleSnapshot`] unless `index` is newer than
    /// every retained snapshot. Storage failures surface as
    /// [`RaftError::SnapshotWrite`] and leave the retained set untouched.
    pub async fn create_snapshot(
        &self,
        index: u64,
        term: u64,
        data: Vec<u8>,
    ) -> Result<SnapshotMetadata> {
        let mut retained = self.retained.lock().await;
        let latest = retained.last().map(|m| m.last_included_index).unwrap_or(0);
        if index <= latest {
            return Err(RaftError::StaleSnapshot { index, latest });
        }

        let meta = self
            .storage
            .save(&Snapshot::new(index, term, data))
            .await
            .map_err(|e| RaftError::SnapshotWrite(e.to_string()))?;
        retained.push(meta.clone());

        while retained.len() > self.retain {
            let evicted = retained.remove(0);
            if let Err(e) = self.storage.delete(&evicted).await {
                tracing::warn!(
                    index = evicted.last_included_index,
                    error = %e,
                    "Failed to delete old snapshot"
                );
            }
        }

        drop(retained);

        let mut installed = self.installed.lock().await;
        if installed
            .as_ref()
            .is_some_and(|s| s.last_included_index <= index)
        {
            *installed = None;
        }

        tracing::debug!(index, term, size = meta.size, "Snapshot persisted");
        Ok(meta)
    }

    /// Take a snapshot received from the leader.
    ///
    /// It is held in memory before the write is attempted, so
    /// [`latest_snapshot`](Self::latest_snapshot) serves it even when
    /// persisting fails.
    pub async fn install(&self, snapshot: Snapshot) -> Result<SnapshotMetadata> {
        let index = snapshot.last_included_index;
        let term = snapshot.last_included_term;
        let data = snapshot.data.clone();
        {
            let mut installed = self.installed.lock().await;
            if installed
                .as_ref()
                .map_or(true, |s| s.last_included_index < index)
            {
                *installed = Some(snapshot);
            }
        }
        self.create_snapshot(index, term, data).await
    }

    pub async fn latest(&self) -> Option<SnapshotMetadata> {
        self.retained.lock().await.last().cloned()
    }

    /// Load the newest snapshot, for shipping to a lagging peer. An installed
    /// snapshot that never reached storage wins over older retained ones.
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let latest = self.latest().await;
        if let Some(snapshot) = self.installed.lock().await.as_ref() {
            if latest
                .as_ref()
                .map_or(true, |m| m.last_included_index < snapshot.last_included_index)
            {
                return Ok(Some(snapshot.clone()));
            }
        }
        match latest {
            Some(meta) => self.storage.load(&meta).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn retained(&self) -> Vec<SnapshotMetadata> {
        self.retained.lock().await.clone()
    }
}
