//! Inbound RPC handling. Every function here runs with the node lock held and
//! never touches the network.

use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::snapshot::Snapshot;

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some_and(|id| id != req.candidate_id) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        state.reset_election_timer();
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: AppendEntriesRequest,
    my_id: u64,
) -> AppendEntriesResponse {
    if req.term < state.current_term {
        return AppendEntriesResponse::rejected(state.current_term);
    }

    // A valid leader for this term: candidates step aside too
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);
    state.reset_election_timer();

    let mut prev_log_index = req.prev_log_index;
    let mut prev_log_term = req.prev_log_term;
    let mut entries = req.entries;

    // Everything up to our compaction boundary is committed and therefore
    // identical to the leader's log; skip ahead to the boundary.
    let base_index = state.log.base_index();
    if prev_log_index < base_index {
        entries.retain(|e| e.index > base_index);
        prev_log_index = base_index;
        prev_log_term = state.log.base_term();
    }

    if !state.log.matches(prev_log_index, prev_log_term) {
        let (conflict_index, conflict_term) = state.log.conflict_hint(prev_log_index);
        tracing::debug!(
            node_id = my_id,
            prev_log_index,
            prev_log_term,
            conflict_index,
            conflict_term,
            "Log inconsistency, rejecting AppendEntries"
        );
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: 0,
            conflict_index,
            conflict_term,
        };
    }

    let received = entries.len();
    let last_new = state.log.merge(prev_log_index, entries);
    if received > 0 {
        tracing::debug!(
            node_id = my_id,
            entries_appended = received,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = req.leader_commit.min(last_new).max(state.commit_index);
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: last_new,
        conflict_index: 0,
        conflict_term: 0,
    }
}

/// Handle InstallSnapshot RPC
///
/// The log is cut at the snapshot boundary and the snapshot is parked in
/// `pending_snapshot`; the apply task restores it and moves `last_applied`.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: InstallSnapshotRequest,
    my_id: u64,
) -> InstallSnapshotResponse {
    if req.term < state.current_term {
        return InstallSnapshotResponse {
            term: state.current_term,
        };
    }

    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);
    state.reset_election_timer();

    let index = req.last_included_index;
    let term = req.last_included_term;
    if index <= state.commit_index {
        tracing::debug!(
            node_id = my_id,
            index,
            commit_index = state.commit_index,
            "Ignoring snapshot already covered by commit index"
        );
        return InstallSnapshotResponse {
            term: state.current_term,
        };
    }

    // A matching entry at the boundary means the tail after it is still valid
    if state.log.matches(index, term) {
        state.log.compact_to(index, term);
    } else {
        state.log.reset_to(index, term);
    }
    state.commit_index = index;
    state.pending_snapshot = Some(Snapshot::new(index, term, req.data));

    tracing::info!(
        node_id = my_id,
        index,
        term,
        leader_id = req.leader_id,
        "Accepted snapshot from leader"
    );

    InstallSnapshotResponse {
        term: state.current_term,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;

    fn follower_with_terms(terms: &[u64]) -> RaftState {
        let mut state = RaftState::new();
        for &term in terms {
            state.log.append(term, vec![term as u8]);
        }
        state.current_term = terms.last().copied().unwrap_or(0);
        state
    }

    fn append(term: u64, prev: (u64, u64), entries: Vec<LogEntry>, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 9,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn test_vote_adopts_higher_term() {
        let mut state = follower_with_terms(&[1]);
        state.voted_for = Some(3);
        let resp = handle_request_vote(
            &mut state,
            &VoteRequest {
                term: 4,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 1,
            },
            1,
        );
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 4);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn test_vote_repeat_for_same_candidate() {
        let mut state = RaftState::new();
        let req = VoteRequest {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(handle_request_vote(&mut state, &req, 1).vote_granted);
        assert!(handle_request_vote(&mut state, &req, 1).vote_granted);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let mut state = follower_with_terms(&[1, 3]);
        let resp = handle_append_entries(&mut state, append(2, (0, 0), vec![], 0), 1);
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_append_candidate_steps_down_same_term() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        let resp = handle_append_entries(&mut state, append(1, (0, 0), vec![], 0), 1);
        assert!(resp.success);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.leader_id, Some(9));
    }

    #[test]
    fn test_append_missing_prev_returns_log_end() {
        let mut state = follower_with_terms(&[1, 1]);
        let resp = handle_append_entries(&mut state, append(2, (5, 2), vec![], 0), 1);
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 3);
        assert_eq!(resp.conflict_term, 0);
    }

    #[test]
    fn test_append_term_mismatch_returns_first_index_of_term() {
        let mut state = follower_with_terms(&[1, 2, 2, 2]);
        let resp = handle_append_entries(&mut state, append(3, (4, 3), vec![], 0), 1);
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 2);
        assert_eq!(resp.conflict_term, 2);
        // rejected requests leave the log alone
        assert_eq!(state.last_log_index(), 4);
    }

    #[test]
    fn test_append_overwrites_divergent_suffix_and_commits() {
        let mut state = follower_with_terms(&[1, 1, 2]);
        let entries = vec![LogEntry::new(3, 3, b"x".to_vec()), LogEntry::new(3, 4, b"y".to_vec())];
        let resp = handle_append_entries(&mut state, append(3, (2, 1), entries, 10), 1);
        assert!(resp.success);
        assert_eq!(resp.match_index, 4);
        assert_eq!(state.log.term_at(3), Some(3));
        assert_eq!(state.last_log_index(), 4);
        // commit is capped at the last entry this request covered
        assert_eq!(state.commit_index, 4);
    }

    #[test]
    fn test_heartbeat_commit_capped_by_prev_index() {
        let mut state = follower_with_terms(&[1, 1, 1]);
        let resp = handle_append_entries(&mut state, append(1, (2, 1), vec![], 3), 1);
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_commit_index_never_decreases() {
        let mut state = follower_with_terms(&[1, 1, 1]);
        state.commit_index = 3;
        let resp = handle_append_entries(&mut state, append(1, (1, 1), vec![], 2), 1);
        assert!(resp.success);
        assert_eq!(state.commit_index, 3);
    }

    #[test]
    fn test_append_below_compaction_boundary() {
        let mut state = follower_with_terms(&[1, 1, 1, 1]);
        state.log.compact_to(3, 1);
        state.commit_index = 3;
        state.last_applied = 3;

        let entries = vec![
            LogEntry::new(1, 2, vec![2]),
            LogEntry::new(1, 3, vec![3]),
            LogEntry::new(1, 4, vec![4]),
            LogEntry::new(1, 5, vec![5]),
        ];
        let resp = handle_append_entries(&mut state, append(1, (1, 1), entries, 5), 1);
        assert!(resp.success);
        assert_eq!(resp.match_index, 5);
        assert_eq!(state.last_log_index(), 5);
        assert_eq!(state.commit_index, 5);
    }

    #[test]
    fn test_install_snapshot_resets_log() {
        let mut state = follower_with_terms(&[1, 1]);
        let resp = handle_install_snapshot(
            &mut state,
            InstallSnapshotRequest {
                term: 3,
                leader_id: 2,
                last_included_index: 10,
                last_included_term: 3,
                data: b"state".to_vec(),
            },
            1,
        );
        assert_eq!(resp.term, 3);
        assert_eq!(state.log.base_index(), 10);
        assert_eq!(state.log.base_term(), 3);
        assert!(state.log.is_empty());
        assert_eq!(state.commit_index, 10);
        assert_eq!(state.last_applied, 0);
        let pending = state.pending_snapshot.as_ref().unwrap();
        assert_eq!(pending.last_included_index, 10);
        assert_eq!(pending.data, b"state".to_vec());
    }

    #[test]
    fn test_install_snapshot_keeps_matching_tail() {
        let mut state = follower_with_terms(&[1, 1, 1, 1]);
        handle_install_snapshot(
            &mut state,
            InstallSnapshotRequest {
                term: 1,
                leader_id: 2,
                last_included_index: 2,
                last_included_term: 1,
                data: vec![],
            },
            1,
        );
        assert_eq!(state.log.base_index(), 2);
        assert_eq!(state.last_log_index(), 4);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_install_snapshot_ignored_when_already_committed() {
        let mut state = follower_with_terms(&[1, 1, 1]);
        state.commit_index = 3;
        handle_install_snapshot(
            &mut state,
            InstallSnapshotRequest {
                term: 1,
                leader_id: 2,
                last_included_index: 2,
                last_included_term: 1,
                data: vec![],
            },
            1,
        );
        assert_eq!(state.log.base_index(), 0);
        assert!(state.pending_snapshot.is_none());
    }

    #[test]
    fn test_install_snapshot_rejects_stale_term() {
        let mut state = follower_with_terms(&[4]);
        let resp = handle_install_snapshot(
            &mut state,
            InstallSnapshotRequest {
                term: 2,
                leader_id: 2,
                last_included_index: 50,
                last_included_term: 2,
                data: vec![],
            },
            1,
        );
        assert_eq!(resp.term, 4);
        assert_eq!(state.log.base_index(), 0);
        assert!(state.pending_snapshot.is_none());
    }
}
