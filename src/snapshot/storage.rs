use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

use crate::error::{RaftError, Result};
use crate::snapshot::{Snapshot, SnapshotMetadata};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Backend that persists snapshot records.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Persist a snapshot and describe what was written.
    async fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMetadata>;

    async fn load(&self, meta: &SnapshotMetadata) -> Result<Snapshot>;

    /// All stored snapshots, oldest (lowest index) first.
    async fn list(&self) -> Result<Vec<SnapshotMetadata>>;

    async fn delete(&self, meta: &SnapshotMetadata) -> Result<()>;
}

/// Snapshot files on the local filesystem.
///
/// Each snapshot is a `<timestamp>-<index>.snap` record (bincode, optionally
/// gzipped) plus a `<timestamp>-<index>.meta.json` sidecar. Both are written
/// to a temp file and renamed into place.
pub struct FileSnapshotStorage {
    dir: PathBuf,
    compress: bool,
}

impl FileSnapshotStorage {
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    fn stem(meta: &SnapshotMetadata) -> String {
        format!(
            "{}-{:020}",
            meta.created_at.format("%Y%m%dT%H%M%S%.6fZ"),
            meta.last_included_index
        )
    }

    fn snapshot_path(&self, meta: &SnapshotMetadata) -> PathBuf {
        self.dir.join(format!("{}.snap", Self::stem(meta)))
    }

    fn metadata_path(&self, meta: &SnapshotMetadata) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::stem(meta)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }

    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(snapshot)?;
        if self.compress {
            Self::compress(&serialized)
        } else {
            Ok(serialized)
        }
    }

    // Compression is detected from the bytes so files survive a config flip.
    fn decode(bytes: &[u8]) -> Result<Snapshot> {
        if bytes.starts_with(&GZIP_MAGIC) {
            Ok(bincode::deserialize(&Self::decompress(bytes)?)?)
        } else {
            Ok(bincode::deserialize(bytes)?)
        }
    }

    async fn write_atomic(&self, path: &PathBuf, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMetadata> {
        fs::create_dir_all(&self.dir).await?;

        let encoded = self.encode(snapshot)?;
        let meta = SnapshotMetadata {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            size: encoded.len() as u64,
            created_at: Utc::now(),
        };

        let snapshot_path = self.snapshot_path(&meta);
        self.write_atomic(&snapshot_path, &encoded).await?;

        // The sidecar goes last: a snapshot without metadata is never listed.
        let metadata_json = serde_json::to_vec_pretty(&meta)?;
        if let Err(e) = self.write_atomic(&self.metadata_path(&meta), &metadata_json).await {
            let _ = fs::remove_file(&snapshot_path).await;
            return Err(e);
        }

        Ok(meta)
    }

    async fn load(&self, meta: &SnapshotMetadata) -> Result<Snapshot> {
        let path = self.snapshot_path(meta);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RaftError::SnapshotNotFound(meta.last_included_index))
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = Self::decode(&bytes)?;
        if snapshot.last_included_index != meta.last_included_index
            || snapshot.last_included_term != meta.last_included_term
        {
            return Err(RaftError::Codec(format!(
                "snapshot file {} does not match its metadata",
                path.display()
            )));
        }
        Ok(snapshot)
    }

    async fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_metadata = path
                .file_name()
                .map(|name| name.to_string_lossy().ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_metadata {
                continue;
            }
            let contents = fs::read(&path).await?;
            match serde_json::from_slice::<SnapshotMetadata>(&contents) {
                Ok(meta) => snapshots.push(meta),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot metadata");
                }
            }
        }

        snapshots.sort_by_key(|m| m.last_included_index);
        Ok(snapshots)
    }

    async fn delete(&self, meta: &SnapshotMetadata) -> Result<()> {
        for path in [self.snapshot_path(meta), self.metadata_path(meta)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Snapshots held in memory, lost on restart.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    records: Mutex<Vec<(SnapshotMetadata, Snapshot)>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<(SnapshotMetadata, Snapshot)>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMetadata> {
        let meta = SnapshotMetadata {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            size: snapshot.data.len() as u64,
            created_at: Utc::now(),
        };
        let mut records = self.records();
        records.push((meta.clone(), snapshot.clone()));
        records.sort_by_key(|(m, _)| m.last_included_index);
        Ok(meta)
    }

    async fn load(&self, meta: &SnapshotMetadata) -> Result<Snapshot> {
        self.records()
            .iter()
            .find(|(m, _)| m.last_included_index == meta.last_included_index)
            .map(|(_, s)| s.clone())
            .ok_or(RaftError::SnapshotNotFound(meta.last_included_index))
    }

    async fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        Ok(self.records().iter().map(|(m, _)| m.clone()).collect())
    }

    async fn delete(&self, meta: &SnapshotMetadata) -> Result<()> {
        self.records()
            .retain(|(m, _)| m.last_included_index != meta.last_included_index);
        Ok(())
    }
}
