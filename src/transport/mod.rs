//! Delivery of Raft RPCs between peers.
//!
//! - [`local`]: in-process network with partition controls, used by tests
//! - [`tcp`]: length-prefixed bincode frames over TCP

pub mod local;
pub mod tcp;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::{serve_rpc, TcpTransport};

/// Sends requests to peers by id. Callers bound every call with their own
/// timeout; implementations only report delivery failures.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer: u64, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    RequestVote,
    AppendEntries,
    InstallSnapshot,
}

impl RpcKind {
    fn slot(self) -> usize {
        match self {
            RpcKind::RequestVote => 0,
            RpcKind::AppendEntries => 1,
            RpcKind::InstallSnapshot => 2,
        }
    }
}

/// Outbound RPC counters, per request kind.
#[derive(Debug, Default)]
pub struct RpcStats {
    requests: [AtomicU64; 3],
    errors: [AtomicU64; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcCounters {
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcStatsSnapshot {
    pub request_vote: RpcCounters,
    pub append_entries: RpcCounters,
    pub install_snapshot: RpcCounters,
}

impl RpcStats {
    pub fn record_request(&self, kind: RpcKind) {
        self.requests[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: RpcKind) {
        self.errors[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self, kind: RpcKind) -> RpcCounters {
        RpcCounters {
            requests: self.requests[kind.slot()].load(Ordering::Relaxed),
            errors: self.errors[kind.slot()].load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> RpcStatsSnapshot {
        RpcStatsSnapshot {
            request_vote: self.counters(RpcKind::RequestVote),
            append_entries: self.counters(RpcKind::AppendEntries),
            install_snapshot: self.counters(RpcKind::InstallSnapshot),
        }
    }
}
