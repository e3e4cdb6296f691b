//! Leader-side log replication: one task per peer, conflict backtracking and
//! the switch to snapshot installation for peers behind the compaction
//! boundary.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use crate::raft::message::{AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest};
use crate::raft::node::RaftNode;
use crate::raft::state::{RaftRole, RaftState};
use crate::transport::RpcKind;

/// What the next replication cycle for a peer should send.
#[derive(Debug)]
pub(crate) enum ReplicationPlan {
    Append(AppendEntriesRequest),
    /// The entries the peer needs have been compacted away.
    Snapshot,
    /// No longer leader for the replicator's term.
    Stop,
}

/// Result of folding a peer's reply into leader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    /// Reply carried a newer term; the node is now a follower.
    StepDown,
    /// Leadership for this term ended while the request was in flight.
    Stale,
    /// The peer accepted; `caught_up` once it holds the whole log.
    Progress { commit_advanced: bool, caught_up: bool },
    /// Consistency check failed; `next_index` has been moved back.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Send again right away.
    Continue,
    /// Wait for the next heartbeat or new entries.
    Idle,
    Stop,
}

pub(crate) fn plan_replication(
    state: &RaftState,
    my_id: u64,
    peer: u64,
    term: u64,
    max_entries: usize,
) -> ReplicationPlan {
    if state.role != RaftRole::Leader || state.current_term != term {
        return ReplicationPlan::Stop;
    }

    let last_index = state.last_log_index();
    let next_index = state
        .next_index
        .get(&peer)
        .copied()
        .unwrap_or(last_index + 1)
        .min(last_index + 1);
    if next_index <= state.log.base_index() {
        return ReplicationPlan::Snapshot;
    }

    let prev_log_index = next_index - 1;
    ReplicationPlan::Append(AppendEntriesRequest {
        term,
        leader_id: my_id,
        prev_log_index,
        prev_log_term: state.log.term_at(prev_log_index).unwrap_or(0),
        entries: state.log.entries_from(next_index, max_entries),
        leader_commit: state.commit_index,
    })
}

/// Apply an AppendEntries reply for a request that started at
/// `prev_log_index` and carried `sent` entries.
pub(crate) fn handle_append_response(
    state: &mut RaftState,
    peer: u64,
    term: u64,
    prev_log_index: u64,
    sent: u64,
    resp: &AppendEntriesResponse,
) -> ReplyOutcome {
    if resp.term > state.current_term {
        state.become_follower(resp.term);
        return ReplyOutcome::StepDown;
    }
    if state.role != RaftRole::Leader || state.current_term != term {
        return ReplyOutcome::Stale;
    }

    if resp.success {
        let matched = state.match_index.entry(peer).or_insert(0);
        *matched = (*matched).max(prev_log_index + sent);
        let next_index = *matched + 1;
        state.next_index.insert(peer, next_index);

        let commit_advanced = state.advance_commit_index();
        return ReplyOutcome::Progress {
            commit_advanced,
            caught_up: next_index > state.last_log_index(),
        };
    }

    // Skip every entry of the conflicting term in one step when the leader
    // has none of it, otherwise resume right after the leader's last one.
    let hinted = if resp.conflict_term > 0 {
        match state.log.last_index_for_term(resp.conflict_term) {
            Some(index) => index + 1,
            None => resp.conflict_index,
        }
    } else {
        resp.conflict_index
    };
    // Always move back so a confused hint cannot stall the peer
    let next_index = hinted.min(prev_log_index).max(1);
    state.next_index.insert(peer, next_index);
    ReplyOutcome::Retry
}

/// Apply an InstallSnapshot reply for a snapshot ending at `last_included_index`.
pub(crate) fn handle_snapshot_response(
    state: &mut RaftState,
    peer: u64,
    term: u64,
    last_included_index: u64,
    resp_term: u64,
) -> ReplyOutcome {
    if resp_term > state.current_term {
        state.become_follower(resp_term);
        return ReplyOutcome::StepDown;
    }
    if state.role != RaftRole::Leader || state.current_term != term {
        return ReplyOutcome::Stale;
    }

    let matched = state.match_index.entry(peer).or_insert(0);
    *matched = (*matched).max(last_included_index);
    let next_index = *matched + 1;
    state.next_index.insert(peer, next_index);

    let commit_advanced = state.advance_commit_index();
    ReplyOutcome::Progress {
        commit_advanced,
        caught_up: next_index > state.last_log_index(),
    }
}

impl RaftNode {
    pub(crate) fn spawn_replicators(self: &Arc<Self>, term: u64) {
        for &peer in &self.peer_ids {
            self.tasks
                .spawn(Arc::clone(self).run_replicator(peer, term));
        }
    }

    /// Replicate to one peer for as long as this node leads `term`.
    ///
    /// Cycles for the same peer never overlap: each request's reply (or
    /// timeout) is folded into `next_index` before the next one is built.
    async fn run_replicator(self: Arc<Self>, peer: u64, term: u64) {
        let mut append_rx = self.append_tx.subscribe();
        // The first tick fires at once and asserts leadership
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(node_id = self.id, peer_id = peer, term, "Replicator started");

        'outer: loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {}
                changed = append_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            loop {
                if self.shutdown.is_cancelled() {
                    break 'outer;
                }
                match self.replicate_once(peer, term).await {
                    Cycle::Continue => continue,
                    Cycle::Idle => break,
                    Cycle::Stop => break 'outer,
                }
            }
        }

        tracing::debug!(node_id = self.id, peer_id = peer, term, "Replicator stopped");
    }

    async fn replicate_once(&self, peer: u64, term: u64) -> Cycle {
        let plan = {
            let state = self.state.lock().await;
            plan_replication(
                &state,
                self.id,
                peer,
                term,
                self.config.max_entries_per_append,
            )
        };

        let req = match plan {
            ReplicationPlan::Stop => return Cycle::Stop,
            ReplicationPlan::Snapshot => return self.send_snapshot(peer, term).await,
            ReplicationPlan::Append(req) => req,
        };

        let prev_log_index = req.prev_log_index;
        let sent = req.entries.len() as u64;
        let resp = match self
            .call_peer(
                RpcKind::AppendEntries,
                peer,
                self.transport.append_entries(peer, req),
            )
            .await
        {
            Ok(resp) => resp,
            Err(_) => return Cycle::Idle,
        };

        let (outcome, commit_index) = {
            let mut state = self.state.lock().await;
            let outcome =
                handle_append_response(&mut state, peer, term, prev_log_index, sent, &resp);
            if outcome == ReplyOutcome::StepDown {
                self.persist_or_log(&mut state);
            }
            (outcome, state.commit_index)
        };
        if outcome == ReplyOutcome::Retry {
            tracing::debug!(
                node_id = self.id,
                peer_id = peer,
                conflict_index = resp.conflict_index,
                conflict_term = resp.conflict_term,
                "AppendEntries rejected, backtracking"
            );
        }
        self.after_reply(peer, outcome, commit_index)
    }

    async fn send_snapshot(&self, peer: u64, term: u64) -> Cycle {
        let snapshot = match self.snapshots.latest_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!(node_id = self.id, peer_id = peer, "Peer needs a snapshot but none exists");
                return Cycle::Idle;
            }
            Err(e) => {
                tracing::warn!(node_id = self.id, peer_id = peer, error = %e, "Failed to load snapshot for peer");
                return Cycle::Idle;
            }
        };

        let last_included_index = snapshot.last_included_index;
        tracing::info!(
            node_id = self.id,
            peer_id = peer,
            index = last_included_index,
            "Sending snapshot to lagging peer"
        );

        let req = InstallSnapshotRequest {
            term,
            leader_id: self.id,
            last_included_index,
            last_included_term: snapshot.last_included_term,
            data: snapshot.data,
        };
        let resp = match self
            .call_peer(
                RpcKind::InstallSnapshot,
                peer,
                self.transport.install_snapshot(peer, req),
            )
            .await
        {
            Ok(resp) => resp,
            Err(_) => return Cycle::Idle,
        };

        let (outcome, commit_index) = {
            let mut state = self.state.lock().await;
            let outcome =
                handle_snapshot_response(&mut state, peer, term, last_included_index, resp.term);
            if outcome == ReplyOutcome::StepDown {
                self.persist_or_log(&mut state);
            }
            (outcome, state.commit_index)
        };
        self.after_reply(peer, outcome, commit_index)
    }

    fn after_reply(&self, peer: u64, outcome: ReplyOutcome, commit_index: u64) -> Cycle {
        match outcome {
            ReplyOutcome::StepDown => {
                tracing::info!(
                    node_id = self.id,
                    peer_id = peer,
                    "Higher term in reply, stepping down"
                );
                Cycle::Stop
            }
            ReplyOutcome::Stale => Cycle::Stop,
            ReplyOutcome::Retry => Cycle::Continue,
            ReplyOutcome::Progress {
                commit_advanced,
                caught_up,
            } => {
                if commit_advanced {
                    tracing::debug!(node_id = self.id, commit_index, "Updated commit index");
                    self.commit_tx.send_replace(commit_index);
                }
                if caught_up {
                    Cycle::Idle
                } else {
                    Cycle::Continue
                }
            }
        }
    }
}
