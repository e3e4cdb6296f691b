use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::log::{LogChanges, LogEntry};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::rpc;
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::storage::{FileRaftStorage, MemoryRaftStorage, RaftStorage};
use crate::snapshot::{Snapshot, SnapshotManager, SnapshotMetadata};
use crate::state_machine::StateMachine;
use crate::transport::{RpcKind, RpcStats, RpcStatsSnapshot, Transport};

type CompactReply = oneshot::Sender<Result<Option<SnapshotMetadata>>>;

/// Point-in-time view of a node, read under a single lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub log_len: usize,
    pub log_base_index: u64,
}

/// A Raft participant.
///
/// All Raft fields live in `state` behind one async mutex. Background tasks
/// (election timer, per-peer replicators, apply loop) take the lock only to
/// read or mutate those fields and never hold it across a network call or a
/// state machine call. Durable writes do happen under the lock, so term, vote
/// and log reach storage before any reply that depends on them.
pub struct RaftNode {
    pub id: u64,
    pub state: Mutex<RaftState>,
    pub(crate) config: NodeConfig,
    pub(crate) peer_ids: Vec<u64>,
    pub(crate) transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    storage: Arc<dyn RaftStorage>,
    pub(crate) snapshots: SnapshotManager,
    stats: RpcStats,
    /// Latest commit index, pinged whenever the apply loop has work.
    pub(crate) commit_tx: watch::Sender<u64>,
    /// Latest log index on the leader, wakes the replicators.
    pub(crate) append_tx: watch::Sender<u64>,
    compact_tx: mpsc::Sender<CompactReply>,
    compact_rx: std::sync::Mutex<Option<mpsc::Receiver<CompactReply>>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

enum ApplyWork {
    Restore(Snapshot),
    Entry(LogEntry),
    Idle,
}

impl RaftNode {
    /// Term, vote and log go to the snapshot directory when one is
    /// configured and stay in memory otherwise.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<Self> {
        let storage: Arc<dyn RaftStorage> = match &config.snapshot.dir {
            Some(dir) => Arc::new(FileRaftStorage::new(dir.clone())),
            None => Arc::new(MemoryRaftStorage::new()),
        };
        Self::with_storage(config, transport, state_machine, storage)
    }

    pub fn with_storage(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
        storage: Arc<dyn RaftStorage>,
    ) -> Result<Self> {
        config.validate()?;

        let (commit_tx, _) = watch::channel(0);
        let (append_tx, _) = watch::channel(0);
        let (compact_tx, compact_rx) = mpsc::channel(8);

        Ok(Self {
            id: config.node_id,
            state: Mutex::new(RaftState::new()),
            peer_ids: config.peer_ids(),
            snapshots: SnapshotManager::from_config(&config.snapshot),
            config,
            transport,
            state_machine,
            storage,
            stats: RpcStats::default(),
            commit_tx,
            append_tx,
            compact_tx,
            compact_rx: std::sync::Mutex::new(Some(compact_rx)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Rebuild state from durable storage: term and vote, the newest
    /// snapshot, and the log tail past it. Must run before
    /// [`start`](Self::start).
    ///
    /// A snapshot or hard state that exists but cannot be read is fatal.
    pub async fn recover(&self) -> Result<()> {
        let (hard_state, tail) = self.storage.load()?;
        let (base_index, base_term) = match self.snapshots.load_latest().await? {
            Some(snapshot) => {
                self.state_machine
                    .restore(&snapshot.data)
                    .map_err(|e| RaftError::SnapshotLoad(e.to_string()))?;
                (snapshot.last_included_index, snapshot.last_included_term)
            }
            None => (0, 0),
        };

        let mut state = self.state.lock().await;
        state.log.restore(base_index, base_term, tail);
        state.commit_index = base_index;
        state.last_applied = base_index;

        state.current_term = hard_state.current_term;
        state.voted_for = hard_state.voted_for;
        if state.last_log_term() > state.current_term {
            state.current_term = state.last_log_term();
            state.voted_for = None;
        }
        state.synced_hard_state = hard_state;
        // Drops stored entries the snapshot already covers
        self.persist(&mut state)?;

        tracing::info!(
            node_id = self.id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            snapshot_index = base_index,
            snapshot_term = base_term,
            last_log_index = state.last_log_index(),
            "Recovered node state"
        );
        Ok(())
    }

    /// Write term, vote and log changes made since the last call. Called with
    /// the state lock held; on failure the changes stay pending and the next
    /// call retries them.
    pub(crate) fn persist(&self, state: &mut RaftState) -> Result<()> {
        let hard_state = state.hard_state();
        if hard_state != state.synced_hard_state {
            self.storage.save_hard_state(&hard_state)?;
            state.synced_hard_state = hard_state;
        }

        match state.log.unsynced() {
            LogChanges::Clean => return Ok(()),
            LogChanges::From(index) => self
                .storage
                .append(index, &state.log.entries_from(index, usize::MAX))?,
            LogChanges::Rewrite => self
                .storage
                .rewrite(&state.log.entries_from(0, usize::MAX))?,
        }
        state.log.mark_synced();
        Ok(())
    }

    /// [`persist`](Self::persist) from a background task, where the only
    /// recourse is to log and retry on the next change.
    pub(crate) fn persist_or_log(&self, state: &mut RaftState) {
        if let Err(e) = self.persist(state) {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist Raft state");
        }
    }

    /// Spawn the election timer and the apply loop.
    pub fn start(self: &Arc<Self>) {
        let compact_rx = self
            .compact_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(compact_rx) = compact_rx else {
            tracing::warn!(node_id = self.id, "Node already started");
            return;
        };

        self.tasks.spawn(Arc::clone(self).run_election_timer());
        self.tasks.spawn(Arc::clone(self).run_apply_loop(compact_rx));

        tracing::info!(
            node_id = self.id,
            peers = ?self.peer_ids,
            "Raft node started"
        );
    }

    /// Signal every task to finish and wait until all of them have exited.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Append a command to the leader's log and return its index.
    ///
    /// Success means the entry is queued for replication, not committed.
    /// Fails with [`RaftError::NotLeader`] on followers and candidates.
    pub async fn propose(&self, command: Vec<u8>) -> Result<u64> {
        if self.is_stopped() {
            return Err(RaftError::Shutdown);
        }

        let (index, term, committed) = {
            let mut state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            let index = state.append_entry(command);
            self.persist(&mut state)?;
            // Only moves in a single-node cluster
            let committed = state.advance_commit_index().then_some(state.commit_index);
            (index, state.current_term, committed)
        };

        tracing::debug!(node_id = self.id, index, term, "Appended command to log");
        self.append_tx.send_replace(index);
        if let Some(commit_index) = committed {
            self.commit_tx.send_replace(commit_index);
        }
        Ok(index)
    }

    pub async fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        let response = rpc::handle_request_vote(&mut state, &req, self.id);
        if let Err(e) = self.persist(&mut state) {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist vote, denying it");
            return VoteResponse {
                term: response.term,
                vote_granted: false,
            };
        }
        response
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let (response, commit_index, advanced) = {
            let mut state = self.state.lock().await;
            let before = state.commit_index;
            let mut response = rpc::handle_append_entries(&mut state, req, self.id);
            if let Err(e) = self.persist(&mut state) {
                tracing::error!(node_id = self.id, error = %e, "Failed to persist entries");
                if response.success {
                    // Not durable, so not acknowledged; the leader resends
                    response = AppendEntriesResponse {
                        conflict_index: response.match_index,
                        ..AppendEntriesResponse::rejected(state.current_term)
                    };
                }
            }
            (response, state.commit_index, state.commit_index > before)
        };
        if advanced {
            self.commit_tx.send_replace(commit_index);
        }
        response
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let (response, commit_index, pending) = {
            let mut state = self.state.lock().await;
            // Keep the snapshot servable before the log boundary moves past it
            if req.term >= state.current_term && req.last_included_index > state.commit_index {
                let snapshot = Snapshot::new(
                    req.last_included_index,
                    req.last_included_term,
                    req.data.clone(),
                );
                match self.snapshots.install(snapshot).await {
                    Ok(_) | Err(RaftError::StaleSnapshot { .. }) => {}
                    Err(e) => tracing::warn!(
                        node_id = self.id,
                        index = req.last_included_index,
                        error = %e,
                        "Failed to persist installed snapshot, keeping it in memory"
                    ),
                }
            }
            let response = rpc::handle_install_snapshot(&mut state, req, self.id);
            self.persist_or_log(&mut state);
            (
                response,
                state.commit_index,
                state.pending_snapshot.is_some(),
            )
        };
        if pending {
            self.commit_tx.send_replace(commit_index);
        }
        response
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            node_id: self.id,
            role: state.role,
            current_term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            log_len: state.log.len(),
            log_base_index: state.log.base_index(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == RaftRole::Leader
    }

    pub async fn leader_id(&self) -> Option<u64> {
        let state = self.state.lock().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn rpc_stats(&self) -> RpcStatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to commit index changes.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Ask the apply task to compact the log up to `last_applied` now.
    ///
    /// Returns `None` when there is nothing new to compact.
    pub async fn compact_now(&self) -> Result<Option<SnapshotMetadata>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.compact_tx
            .send(reply_tx)
            .await
            .map_err(|_| RaftError::Shutdown)?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RaftError::Shutdown),
            reply = reply_rx => reply.map_err(|_| RaftError::Shutdown)?,
        }
    }

    /// Run an outbound RPC under the configured timeout, counting requests
    /// and failures.
    pub(crate) async fn call_peer<T, F>(&self, kind: RpcKind, peer: u64, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.stats.record_request(kind);
        let result = match tokio::time::timeout(self.config.rpc_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout),
        };
        if let Err(e) = &result {
            self.stats.record_error(kind);
            if e.is_transient() {
                tracing::trace!(node_id = self.id, peer_id = peer, rpc = ?kind, error = %e, "RPC failed");
            } else {
                tracing::warn!(node_id = self.id, peer_id = peer, rpc = ?kind, error = %e, "RPC failed");
            }
        }
        result
    }

    async fn run_apply_loop(self: Arc<Self>, mut compact_rx: mpsc::Receiver<CompactReply>) {
        let mut commit_rx = self.commit_tx.subscribe();
        let period = self.config.snapshot_interval();
        let mut snapshot_timer = interval_at(Instant::now() + period, period);
        snapshot_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.apply_committed().await {
                Ok(()) => self.compact_if_over_threshold().await,
                Err(e) => tracing::error!(node_id = self.id, error = %e, "Failed to apply committed entries"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = snapshot_timer.tick() => {
                    if self.is_leader().await {
                        if let Err(e) = self.compact().await {
                            tracing::warn!(node_id = self.id, error = %e, "Periodic compaction failed");
                        }
                    }
                }
                Some(reply) = compact_rx.recv() => {
                    // Bring the state machine up to date before snapshotting it
                    let result = match self.apply_committed().await {
                        Ok(()) => self.compact().await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!(node_id = self.id, "Apply loop stopped");
    }

    /// Deliver `(last_applied, commit_index]` to the state machine in order,
    /// restoring a snapshot from the leader first if one is waiting.
    async fn apply_committed(&self) -> Result<()> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }

            let work = {
                let mut state = self.state.lock().await;
                if let Some(snapshot) = state.pending_snapshot.take() {
                    ApplyWork::Restore(snapshot)
                } else if state.last_applied < state.commit_index {
                    let next = state.last_applied + 1;
                    match state.log.entry(next) {
                        Some(entry) => ApplyWork::Entry(entry.clone()),
                        None => {
                            tracing::error!(
                                node_id = self.id,
                                index = next,
                                base_index = state.log.base_index(),
                                "Committed entry missing from log"
                            );
                            return Err(RaftError::LogInconsistency);
                        }
                    }
                } else {
                    ApplyWork::Idle
                }
            };

            match work {
                ApplyWork::Idle => return Ok(()),
                ApplyWork::Restore(snapshot) => self.restore_snapshot(snapshot).await?,
                ApplyWork::Entry(entry) => {
                    if !entry.is_noop() {
                        self.state_machine.apply(entry.index, &entry.command)?;
                    }
                    let mut state = self.state.lock().await;
                    state.last_applied = state.last_applied.max(entry.index);
                }
            }
        }
    }

    async fn restore_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.last_included_index;
        let term = snapshot.last_included_term;

        if let Err(e) = self.state_machine.restore(&snapshot.data) {
            let mut state = self.state.lock().await;
            if state.pending_snapshot.is_none() {
                state.pending_snapshot = Some(snapshot);
            }
            return Err(e);
        }
        {
            let mut state = self.state.lock().await;
            state.last_applied = state.last_applied.max(index);
        }
        tracing::info!(node_id = self.id, index, term, "Restored snapshot from leader");
        Ok(())
    }

    async fn compact_if_over_threshold(&self) {
        let due = {
            let state = self.state.lock().await;
            state.last_applied.saturating_sub(state.log.base_index())
                >= self.config.snapshot.compaction_threshold
        };
        if due {
            if let Err(e) = self.compact().await {
                tracing::warn!(node_id = self.id, error = %e, "Threshold compaction failed");
            }
        }
    }

    /// Snapshot the state machine at `last_applied` and drop the covered log
    /// prefix. Runs only on the apply task, so the state machine reflects
    /// exactly `last_applied`. On failure the log is left untouched.
    async fn compact(&self) -> Result<Option<SnapshotMetadata>> {
        let (index, term) = {
            let state = self.state.lock().await;
            let index = state.last_applied;
            if index <= state.log.base_index() {
                return Ok(None);
            }
            let term = state
                .log
                .term_at(index)
                .ok_or(RaftError::LogInconsistency)?;
            (index, term)
        };

        let data = self.state_machine.snapshot()?;
        let meta = self.snapshots.create_snapshot(index, term, data).await?;

        let remaining = {
            let mut state = self.state.lock().await;
            state.log.compact_to(index, term);
            self.persist_or_log(&mut state);
            state.log.len()
        };

        tracing::info!(
            node_id = self.id,
            index,
            term,
            size = meta.size,
            remaining_entries = remaining,
            "Compacted log into snapshot"
        );
        Ok(Some(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvStore};
    use crate::transport::LocalNetwork;
    use std::time::Duration;

    fn node_with(config: NodeConfig) -> (Arc<RaftNode>, Arc<KvStore>) {
        let network = LocalNetwork::new();
        let store = Arc::new(KvStore::new());
        let node = Arc::new(
            RaftNode::new(config.clone(), network.transport(config.node_id), store.clone())
                .unwrap(),
        );
        network.register(&node);
        (node, store)
    }

    fn three_node_config() -> NodeConfig {
        NodeConfig::default()
            .with_peer(2, "local:2".into())
            .with_peer(3, "local:3".into())
    }

    fn vote_request(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Records every command handed to it, in order.
    #[derive(Default)]
    struct RecordingStateMachine {
        applied: std::sync::Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl RecordingStateMachine {
        fn applied(&self) -> Vec<(u64, Vec<u8>)> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&self, index: u64, command: &[u8]) -> Result<()> {
            self.applied.lock().unwrap().push((index, command.to_vec()));
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn restore(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = NodeConfig::default();
        config.heartbeat_interval_ms = 500;
        let network = LocalNetwork::new();
        let result = RaftNode::new(config, network.transport(1), Arc::new(KvStore::new()));
        assert!(matches!(result, Err(RaftError::Config(_))));
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals_with_leader_hint() {
        let (node, _) = node_with(NodeConfig::default().with_peer(2, "local:2".into()));
        node.state.lock().await.leader_id = Some(2);

        let err = node.propose(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(Some(2))));
    }

    #[tokio::test]
    async fn test_empty_payload_reaches_state_machine() {
        let network = LocalNetwork::new();
        let machine = Arc::new(RecordingStateMachine::default());
        let node = Arc::new(
            RaftNode::new(NodeConfig::default(), network.transport(1), machine.clone()).unwrap(),
        );
        network.register(&node);
        node.start();
        wait_until(|| node.is_leader()).await;

        let index = node.propose(Vec::new()).await.unwrap();
        assert_eq!(index, 2);
        wait_until(|| async { !machine.applied().is_empty() }).await;

        // The leader no-op at index 1 is withheld, the empty command is not
        assert_eq!(machine.applied(), vec![(2, Vec::new())]);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_single_node_commits_and_applies() {
        let (node, store) = node_with(NodeConfig::default());
        node.start();
        wait_until(|| node.is_leader()).await;

        let index = node
            .propose(KvCommand::set("a", "1").encode().unwrap())
            .await
            .unwrap();
        assert_eq!(index, 2, "index 1 holds the leader no-op");

        wait_until(|| async { store.get("a").is_some() }).await;
        let status = node.status().await;
        assert_eq!(status.role, RaftRole::Leader);
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.leader_id, Some(1));
        assert_eq!(store.last_applied(), 2);

        node.stop().await;
        assert!(matches!(
            node.propose(b"y".to_vec()).await,
            Err(RaftError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_compact_now_snapshots_applied_prefix() {
        let (node, store) = node_with(NodeConfig::default());
        node.start();
        wait_until(|| node.is_leader()).await;

        for i in 0..5 {
            node.propose(KvCommand::set(format!("k{i}"), "v").encode().unwrap())
                .await
                .unwrap();
        }
        let meta = node.compact_now().await.unwrap().unwrap();
        assert_eq!(meta.last_included_index, 6);
        assert_eq!(store.len(), 5);

        let status = node.status().await;
        assert_eq!(status.log_base_index, 6);
        assert_eq!(status.log_len, 0);
        assert_eq!(status.last_log_index, 6);

        let snapshot = node.snapshots().latest_snapshot().await.unwrap().unwrap();
        let restored = KvStore::new();
        restored.restore(&snapshot.data).unwrap();
        assert_eq!(restored.entries(), store.entries());

        node.stop().await;
    }

    #[tokio::test]
    async fn test_recover_uses_snapshot_and_drops_covered_tail() {
        let storage = Arc::new(MemoryRaftStorage::new());
        storage
            .append(
                2,
                &[
                    LogEntry::new(2, 2, b"old".to_vec()),
                    LogEntry::new(2, 3, b"old".to_vec()),
                    LogEntry::new(2, 4, KvCommand::set("b", "2").encode().unwrap()),
                ],
            )
            .unwrap();
        let network = LocalNetwork::new();
        let store = Arc::new(KvStore::new());
        let node = RaftNode::with_storage(
            NodeConfig::default(),
            network.transport(1),
            store.clone(),
            storage.clone(),
        )
        .unwrap();

        let source = KvStore::new();
        source
            .apply(1, &KvCommand::set("a", "1").encode().unwrap())
            .unwrap();
        node.snapshots()
            .create_snapshot(3, 2, source.snapshot().unwrap())
            .await
            .unwrap();

        node.recover().await.unwrap();

        let status = node.status().await;
        assert_eq!(status.log_base_index, 3);
        assert_eq!(status.last_log_index, 4);
        assert_eq!(status.commit_index, 3);
        assert_eq!(status.last_applied, 3);
        assert_eq!(status.current_term, 2);
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(node.state.lock().await.last_log_term(), 2);

        // Storage now holds only the entry past the snapshot
        let (_, stored) = storage.load().unwrap();
        assert_eq!(stored.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4]);
    }

    #[tokio::test]
    async fn test_restart_keeps_vote_and_acknowledged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = three_node_config();
        config.snapshot.dir = Some(dir.path().to_path_buf());

        let (node, _) = node_with(config.clone());
        node.recover().await.unwrap();
        assert!(node.handle_request_vote(vote_request(5, 2, 0, 0)).await.vote_granted);
        let ack = node
            .handle_append_entries(AppendEntriesRequest {
                term: 5,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::new(5, 1, b"acked".to_vec())],
                leader_commit: 0,
            })
            .await;
        assert!(ack.success);
        assert_eq!(ack.match_index, 1);
        drop(node);

        let (restarted, _) = node_with(config);
        restarted.recover().await.unwrap();
        let status = restarted.status().await;
        assert_eq!(status.current_term, 5);
        assert_eq!(status.last_log_index, 1);
        {
            let state = restarted.state.lock().await;
            assert_eq!(state.voted_for, Some(2));
            assert_eq!(state.log.entry(1).unwrap().command, b"acked".to_vec());
        }

        // Same term, another candidate with an equally fresh log: no second vote
        let second = restarted.handle_request_vote(vote_request(5, 3, 1, 5)).await;
        assert!(!second.vote_granted);
        assert_eq!(second.term, 5);
        assert!(restarted.handle_request_vote(vote_request(5, 2, 1, 5)).await.vote_granted);
    }

    #[tokio::test]
    async fn test_installed_snapshot_stays_servable_when_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_dir = dir.path().join("snapshots");
        let mut config = three_node_config();
        config.snapshot.dir = Some(snapshot_dir.clone());

        let network = LocalNetwork::new();
        let node = RaftNode::with_storage(
            config,
            network.transport(1),
            Arc::new(KvStore::new()),
            Arc::new(MemoryRaftStorage::new()),
        )
        .unwrap();
        node.recover().await.unwrap();
        // Every snapshot write fails from here on
        std::fs::write(&snapshot_dir, b"not a directory").unwrap();

        let source = KvStore::new();
        source
            .apply(10, &KvCommand::set("k", "v").encode().unwrap())
            .unwrap();
        let resp = node
            .handle_install_snapshot(InstallSnapshotRequest {
                term: 2,
                leader_id: 2,
                last_included_index: 10,
                last_included_term: 2,
                data: source.snapshot().unwrap(),
            })
            .await;
        assert_eq!(resp.term, 2);

        let status = node.status().await;
        assert_eq!(status.log_base_index, 10);
        assert!(node.snapshots().latest().await.is_none());

        // Were this node to lead, a peer behind index 10 still gets a snapshot
        let served = node.snapshots().latest_snapshot().await.unwrap().unwrap();
        assert_eq!(served.last_included_index, status.log_base_index);
        assert_eq!(served.last_included_term, 2);
    }

    #[tokio::test]
    async fn test_status_reports_fresh_follower() {
        let (node, _) = node_with(NodeConfig::default().with_peer(2, "local:2".into()));
        let status = node.status().await;
        assert_eq!(status.role, RaftRole::Follower);
        assert_eq!(status.current_term, 0);
        assert_eq!(status.leader_id, None);
        assert_eq!(status.last_log_index, 0);
        assert!(!node.is_stopped());
    }
}
