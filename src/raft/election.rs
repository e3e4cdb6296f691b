//! Election timer, vote solicitation and the Candidate -> Leader transition.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::Result;
use crate::raft::message::{VoteRequest, VoteResponse};
use crate::raft::node::RaftNode;
use crate::raft::state::RaftRole;
use crate::raft::timer::random_election_timeout;
use crate::transport::RpcKind;

impl RaftNode {
    /// Start an election whenever no leader or vote grant has reset the timer
    /// for a full, freshly randomized timeout.
    pub(crate) async fn run_election_timer(self: Arc<Self>) {
        loop {
            let timeout = random_election_timeout(&self.config);
            let deadline = {
                let state = self.state.lock().await;
                if state.role == RaftRole::Leader {
                    Instant::now() + timeout
                } else {
                    state.last_heartbeat + timeout
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let expired = {
                let state = self.state.lock().await;
                state.role != RaftRole::Leader && state.last_heartbeat.elapsed() >= timeout
            };
            if expired {
                self.start_election().await;
            }
        }
        tracing::debug!(node_id = self.id, "Election timer stopped");
    }

    /// Become candidate for the next term and collect votes in parallel.
    async fn start_election(self: &Arc<Self>) {
        let request = {
            let mut state = self.state.lock().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            // A vote for ourselves that is not on disk could be cast twice
            if let Err(e) = self.persist(&mut state) {
                tracing::error!(node_id = self.id, error = %e, "Failed to persist candidacy");
                state.role = RaftRole::Follower;
                return;
            }
            VoteRequest {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };
        let term = request.term;
        let quorum = self.config.quorum();

        tracing::info!(node_id = self.id, term, "Election timeout, starting election");

        let mut votes = 1usize;
        if votes >= quorum {
            self.try_become_leader(term, votes).await;
            return;
        }

        let mut pending: JoinSet<(u64, Result<VoteResponse>)> = JoinSet::new();
        for &peer in &self.peer_ids {
            let node = Arc::clone(self);
            let req = request.clone();
            pending.spawn(self.tasks.track_future(async move {
                let result = node
                    .call_peer(
                        RpcKind::RequestVote,
                        peer,
                        node.transport.request_vote(peer, req),
                    )
                    .await;
                (peer, result)
            }));
        }

        loop {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                joined = pending.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (peer, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(node_id = self.id, error = %e, "Vote task failed");
                    continue;
                }
            };

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(node_id = self.id, peer_id = peer, error = %e, "Vote request failed");
                    continue;
                }
            };

            if response.term > term {
                let mut state = self.state.lock().await;
                if response.term > state.current_term {
                    tracing::info!(
                        node_id = self.id,
                        term = response.term,
                        peer_id = peer,
                        "Higher term seen during election, stepping down"
                    );
                    state.become_follower(response.term);
                    self.persist_or_log(&mut state);
                }
                return;
            }

            if response.vote_granted {
                votes += 1;
                tracing::debug!(node_id = self.id, peer_id = peer, term, votes, "Received vote");
                if votes >= quorum {
                    self.try_become_leader(term, votes).await;
                    return;
                }
            }
        }

        tracing::debug!(
            node_id = self.id,
            term,
            votes,
            needed = quorum,
            "Election failed, not enough votes"
        );
    }

    /// Take leadership for `term` if still a candidate in it, append the
    /// leader's no-op and start replicating.
    async fn try_become_leader(self: &Arc<Self>, term: u64, votes: usize) {
        let (last_index, committed) = {
            let mut state = self.state.lock().await;
            if state.role != RaftRole::Candidate || state.current_term != term {
                return;
            }
            state.become_leader(self.id, &self.peer_ids);
            let last_index = state.append_noop();
            self.persist_or_log(&mut state);
            let committed = state.advance_commit_index().then_some(state.commit_index);
            (last_index, committed)
        };

        tracing::info!(node_id = self.id, term, votes, "Became leader");

        self.append_tx.send_replace(last_index);
        if let Some(commit_index) = committed {
            self.commit_tx.send_replace(commit_index);
        }
        self.spawn_replicators(term);
    }
}
