//! RPC messages exchanged between Raft peers.

use serde::{Deserialize, Serialize};

use crate::raft::log::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Entries to replicate, or a heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Last index known to match the leader, set on success.
    pub match_index: u64,
    /// First index of `conflict_term` in the follower's log, or its
    /// `last_index + 1` when `prev_log_index` is missing.
    pub conflict_index: u64,
    /// Term found at `prev_log_index`, 0 when the entry is missing.
    pub conflict_term: u64,
}

impl AppendEntriesResponse {
    pub fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            match_index: 0,
            conflict_index: 0,
            conflict_term: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Wire envelope for requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

/// Wire envelope for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}
