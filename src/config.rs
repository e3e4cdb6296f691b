use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Snapshot and log compaction settings.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory for snapshot files. `None` keeps snapshots in memory only.
    pub dir: Option<PathBuf>,
    /// Number of snapshots kept on disk; older ones are deleted.
    pub retain: usize,
    /// How often the leader compacts its log.
    pub interval_ms: u64,
    /// Applied entries beyond the compaction boundary that force a compaction
    /// on any node.
    pub compaction_threshold: u64,
    /// Gzip snapshot files.
    pub compress: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retain: 3,
            interval_ms: 600_000,
            compaction_threshold: 1000,
            compress: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Bound on every outbound RPC.
    pub rpc_timeout_ms: u64,
    pub max_entries_per_append: usize,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
    /// HTTP front-end of the peer, used to redirect writes to the leader.
    pub http_addr: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            http_addr: None,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_entries_per_append: 256,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            addr,
            http_addr: None,
        });
        self
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    pub fn peer(&self, node_id: u64) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    /// Strict majority of the full cluster, self included.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::Config(format!(
                "invalid election timeout range {}..={}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config(
                "max_entries_per_append must be positive".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 || self.snapshot.interval_ms == 0 {
            return Err(RaftError::Config(
                "rpc timeout and snapshot interval must be positive".into(),
            ));
        }
        if self.snapshot.retain == 0 {
            return Err(RaftError::Config(
                "snapshot retention must keep at least one snapshot".into(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(RaftError::Config(format!(
                    "peer list contains this node's own id {}",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}
