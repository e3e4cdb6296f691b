//! Durable term, vote and log.
//!
//! The hard state is rewritten whole on every change. The log is an
//! append-only file of length-prefixed bincode records; a `Truncate` record
//! drops the suffix a follower replaced, and compaction rewrites the file
//! with just the retained tail.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::log::LogEntry;

const HARD_STATE_FILE: &str = "hard_state.bin";
const LOG_FILE: &str = "raft.log";

/// The part of [`RaftState`](crate::raft::RaftState) that must survive a
/// restart before the node answers an RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    /// Forget every entry at or after this index.
    Truncate(u64),
    Append(LogEntry),
}

/// Backend for the node's durable state.
///
/// Calls are synchronous and made with the node lock held, so writes reach
/// storage in the order the state changed.
pub trait RaftStorage: Send + Sync {
    /// Read back the hard state and every retained log entry, in index order.
    fn load(&self) -> Result<(HardState, Vec<LogEntry>)>;

    fn save_hard_state(&self, hard_state: &HardState) -> Result<()>;

    /// Drop stored entries at or after `from`, then append `entries`.
    fn append(&self, from: u64, entries: &[LogEntry]) -> Result<()>;

    /// Replace the stored log with `entries`.
    fn rewrite(&self, entries: &[LogEntry]) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_records(records: &[LogRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        let bytes = bincode::serialize(record)?;
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

/// Keep entries below `index`. Entries are held in index order.
fn truncate_entries(entries: &mut Vec<LogEntry>, index: u64) {
    let keep = entries.partition_point(|e| e.index < index);
    entries.truncate(keep);
}

/// Hard state and log files in a data directory.
pub struct FileRaftStorage {
    dir: PathBuf,
    /// Append handle to the log file, opened on first use.
    log: Mutex<Option<File>>,
}

impl FileRaftStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            log: Mutex::new(None),
        }
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join(HARD_STATE_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replay the log file. A torn record at the end is cut off.
    fn replay_log(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut offset = 0;
        while offset + 4 <= bytes.len() {
            let mut len = [0u8; 4];
            len.copy_from_slice(&bytes[offset..offset + 4]);
            let start = offset + 4;
            let end = start + u32::from_be_bytes(len) as usize;
            if end > bytes.len() {
                break;
            }
            let record: LogRecord = match bincode::deserialize(&bytes[start..end]) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Undecodable log record, discarding remainder");
                    break;
                }
            };
            match record {
                LogRecord::Truncate(index) => truncate_entries(&mut entries, index),
                LogRecord::Append(entry) => {
                    truncate_entries(&mut entries, entry.index);
                    entries.push(entry);
                }
            }
            offset = end;
        }

        if offset < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = offset,
                file_bytes = bytes.len(),
                "Cutting torn tail off the log file"
            );
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(offset as u64)?;
        }
        Ok(entries)
    }
}

impl RaftStorage for FileRaftStorage {
    fn load(&self) -> Result<(HardState, Vec<LogEntry>)> {
        let hard_state = match fs::read(self.hard_state_path()) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| RaftError::Codec(format!("hard state: {e}")))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok((hard_state, self.replay_log()?))
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        self.write_atomic(&self.hard_state_path(), &bincode::serialize(hard_state)?)
    }

    fn append(&self, from: u64, entries: &[LogEntry]) -> Result<()> {
        let mut records = Vec::with_capacity(entries.len() + 1);
        records.push(LogRecord::Truncate(from));
        records.extend(entries.iter().cloned().map(LogRecord::Append));
        let bytes = encode_records(&records)?;

        let mut log = lock(&self.log);
        if log.is_none() {
            fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path())?;
            *log = Some(file);
        }
        if let Some(file) = log.as_mut() {
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn rewrite(&self, entries: &[LogEntry]) -> Result<()> {
        let records: Vec<LogRecord> = entries.iter().cloned().map(LogRecord::Append).collect();
        let bytes = encode_records(&records)?;

        let mut log = lock(&self.log);
        // The old handle points at the file being replaced
        *log = None;
        self.write_atomic(&self.log_path(), &bytes)
    }
}

/// Durable state held in memory; lost when the storage is dropped.
#[derive(Default)]
pub struct MemoryRaftStorage {
    hard_state: Mutex<HardState>,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryRaftStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemoryRaftStorage {
    fn load(&self) -> Result<(HardState, Vec<LogEntry>)> {
        Ok((*lock(&self.hard_state), lock(&self.entries).clone()))
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        *lock(&self.hard_state) = *hard_state;
        Ok(())
    }

    fn append(&self, from: u64, entries: &[LogEntry]) -> Result<()> {
        let mut stored = lock(&self.entries);
        truncate_entries(&mut stored, from);
        stored.extend_from_slice(entries);
        Ok(())
    }

    fn rewrite(&self, entries: &[LogEntry]) -> Result<()> {
        *lock(&self.entries) = entries.to_vec();
        Ok(())
    }
}
