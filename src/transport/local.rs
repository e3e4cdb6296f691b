use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;

use crate::error::{RaftError, Result};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;
use crate::transport::Transport;

/// In-process network connecting [`RaftNode`]s directly.
///
/// Links are bidirectional. A blocked link drops both the request and the
/// reply, which the sender observes as [`RaftError::Unreachable`].
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Weak<RaftNode>>>,
    blocked: RwLock<HashSet<(u64, u64)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node `node_id`, sending over this network.
    pub fn transport(self: &Arc<Self>, node_id: u64) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: node_id,
            network: Arc::clone(self),
        })
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes_mut().insert(node.id, Arc::downgrade(node));
    }

    /// Forget a node entirely, as if it crashed.
    pub fn remove(&self, node_id: u64) {
        self.nodes_mut().remove(&node_id);
    }

    pub fn disconnect(&self, a: u64, b: u64) {
        self.blocked_mut().insert(link(a, b));
    }

    pub fn reconnect(&self, a: u64, b: u64) {
        self.blocked_mut().remove(&link(a, b));
    }

    /// Cut every link touching `node_id`.
    pub fn isolate(&self, node_id: u64) {
        let others: Vec<u64> = self.node_ids().into_iter().filter(|&id| id != node_id).collect();
        let mut blocked = self.blocked_mut();
        for other in others {
            blocked.insert(link(node_id, other));
        }
    }

    /// Restore every link touching `node_id`.
    pub fn heal(&self, node_id: u64) {
        self.blocked_mut()
            .retain(|&(a, b)| a != node_id && b != node_id);
    }

    pub fn heal_all(&self) {
        self.blocked_mut().clear();
    }

    pub fn is_connected(&self, a: u64, b: u64) -> bool {
        !self
            .blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&link(a, b))
    }

    pub fn node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn route(&self, from: u64, to: u64) -> Result<Arc<RaftNode>> {
        if !self.is_connected(from, to) {
            return Err(RaftError::Unreachable(to));
        }
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(RaftError::Unreachable(to))
    }

    // A partition raised while the request was in flight loses the reply
    fn deliver<T>(&self, from: u64, to: u64, reply: T) -> Result<T> {
        if self.is_connected(from, to) {
            Ok(reply)
        } else {
            Err(RaftError::Unreachable(to))
        }
    }

    fn nodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Weak<RaftNode>>> {
        self.nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blocked_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<(u64, u64)>> {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn link(a: u64, b: u64) -> (u64, u64) {
    (a.min(b), a.max(b))
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    from: u64,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, peer: u64, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.route(self.from, peer)?;
        let reply = node.handle_request_vote(req).await;
        self.network.deliver(self.from, peer, reply)
    }

    async fn append_entries(
        &self,
        peer: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, peer)?;
        let reply = node.handle_append_entries(req).await;
        self.network.deliver(self.from, peer, reply)
    }

    async fn install_snapshot(
        &self,
        peer: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.network.route(self.from, peer)?;
        let reply = node.handle_install_snapshot(req).await;
        self.network.deliver(self.from, peer, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_are_bidirectional() {
        let network = LocalNetwork::new();
        network.disconnect(1, 2);
        assert!(!network.is_connected(2, 1));
        assert!(network.is_connected(1, 3));
        network.reconnect(2, 1);
        assert!(network.is_connected(1, 2));
    }

    #[test]
    fn test_heal_restores_only_that_node() {
        let network = LocalNetwork::new();
        network.disconnect(1, 2);
        network.disconnect(2, 3);
        network.disconnect(3, 4);
        network.heal(2);
        assert!(network.is_connected(1, 2));
        assert!(network.is_connected(2, 3));
        assert!(!network.is_connected(3, 4));
        network.heal_all();
        assert!(network.is_connected(3, 4));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let network = LocalNetwork::new();
        let transport = network.transport(1);
        let err = transport
            .request_vote(
                2,
                VoteRequest {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Unreachable(2)));
    }
}
