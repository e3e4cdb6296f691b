//! Snapshot persistence and log compaction bookkeeping.
//!
//! - [`storage`]: where snapshot records live (files or memory)
//! - [`manager`]: ordering, retention and lookup of snapshots

pub mod manager;
pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::SnapshotManager;
pub use storage::{FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage};

/// A checkpoint of the state machine covering the log up to
/// `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Opaque state machine blob.
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_included_index: u64, last_included_term: u64, data: Vec<u8>) -> Self {
        Self {
            last_included_index,
            last_included_term,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Bytes taken by the persisted record.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}
