use std::collections::HashMap;

use serde::Serialize;
use tokio::time::Instant;

use crate::raft::log::RaftLog;
use crate::raft::storage::HardState;
use crate::snapshot::Snapshot;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Everything a node knows about the cluster, guarded by one lock in
/// [`RaftNode`](crate::raft::RaftNode).
///
/// # Safety properties
///
/// ## Election safety
/// `voted_for` is cleared only when `current_term` advances, so a node grants
/// at most one vote per term and two candidates can never both collect a
/// quorum in the same term.
///
/// ## Log matching
/// Followers accept entries only after `prev_log_index`/`prev_log_term`
/// match, and replace a divergent suffix instead of merging around it.
///
/// ## Leader completeness
/// Votes go only to candidates whose last entry is at least as recent as the
/// voter's (`is_log_up_to_date`), and a leader advances `commit_index` only
/// onto an entry of its own term (`advance_commit_index`).
///
/// ## Apply ordering
/// `last_applied <= commit_index <= log.last_index()` at all times, and only
/// the apply task moves `last_applied`.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,

    pub commit_index: u64,
    pub last_applied: u64,

    // Leader only, rebuilt on every election win
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,
    pub leader_id: Option<u64>,

    /// Last time a leader or a vote grant reset the election timer.
    pub last_heartbeat: Instant,

    /// Snapshot received from the leader, waiting for the apply task to
    /// restore it into the state machine.
    pub pending_snapshot: Option<Snapshot>,

    /// Term and vote as last written to durable storage.
    pub synced_hard_state: HardState,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            pending_snapshot: None,
            synced_hard_state: HardState::default(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Append a command in the current term, returning its index.
    pub fn append_entry(&mut self, command: Vec<u8>) -> u64 {
        self.log.append(self.current_term, command)
    }

    /// Append the no-op a new leader commits to settle earlier terms.
    pub fn append_noop(&mut self) -> u64 {
        self.log.append_noop(self.current_term)
    }

    /// Check if a candidate's log is at least as up-to-date as ours:
    /// a later last term wins, equal terms compare by index.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_log_index())
    }

    pub fn reset_election_timer(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Revert to follower. The vote and known leader are forgotten only when
    /// `term` is newer than the current one.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Start a new term as candidate, voting for ourselves.
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
        self.reset_election_timer();
    }

    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Move `commit_index` to the highest index stored on a majority, provided
    /// that entry belongs to the current term. Returns whether it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut replicated: Vec<u64> = self.match_index.values().copied().collect();
        replicated.push(self.last_log_index());
        replicated.sort_unstable();
        let majority_index = replicated[(replicated.len() - 1) / 2];

        if majority_index > self.commit_index
            && self.log.term_at(majority_index) == Some(self.current_term)
        {
            self.commit_index = majority_index;
            return true;
        }
        false
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
