//! Failover tests for Raft leader failure and recovery.
//!
//! These tests verify cluster behavior when leaders crash: a new leader is
//! elected, entries that reached a majority survive, and restarted nodes
//! catch up.


use std::time::Duration;
use test_harness::{assert_eventually, wait_for, TestCluster};

/// New leader is elected after leader crash, in a higher term
#[tokio::test]
async fn test_new_leader_election_after_crash() {
    let mut cluster = TestCluster::new(3).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster
        .get_node(initial_leader)
        .unwrap()
        .current_term()
        .await;

    assert!(cluster.crash_node(initial_leader).await);

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");
    assert_ne!(new_leader, initial_leader);

    let new_term = cluster.get_node(new_leader).unwrap().current_term().await;
    assert!(new_term > initial_term, "Term should increase after new election");
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

/// An entry stored on the leader and one follower survives the leader's crash
/// and is committed by the next leader.
#[tokio::test]
async fn test_entry_on_majority_survives_leader_crash() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != leader_id)
        .collect();
    let (follower, lagging) = (others[0], others[1]);

    // The lagging follower never hears about the entry from this leader
    cluster.create_partition(&[leader_id], &[lagging]);

    let index = cluster.set_on(leader_id, "survivor", "yes").await.unwrap();
    let replicated = wait_for(
        || async { cluster.get_node(follower).unwrap().last_log_index().await >= index },
        Duration::from_secs(3),
        Duration::from_millis(5),
    )
    .await;
    assert!(replicated, "Entry should reach the connected follower");
    assert!(cluster.get_node(lagging).unwrap().last_log_index().await < index);

    assert!(cluster.crash_node(leader_id).await);

    // Only the follower holding the entry can win: the lagging node's log is
    // behind, so it never gets the follower's vote.
    let new_leader = cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("A new leader should be elected");
    assert_eq!(new_leader, follower);

    assert!(
        cluster
            .wait_for_value_on(&others, "survivor", "yes", Duration::from_secs(5))
            .await,
        "Both remaining nodes should apply the surviving entry"
    );

    cluster.shutdown().await;
}

/// Writes keep working across several leader crashes while a quorum remains
#[tokio::test]
async fn test_sequential_leader_failures() {
    let mut cluster = TestCluster::new(5).await;

    for round in 0..2 {
        let leader = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("Leader should be elected");
        cluster
            .set(&format!("round{}", round), "done")
            .await
            .unwrap();

        let ids = cluster.active_node_ids();
        assert!(
            cluster
                .wait_for_value_on(&ids, &format!("round{}", round), "done", Duration::from_secs(3))
                .await
        );
        assert!(cluster.crash_node(leader).await);
    }

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Three of five nodes still form a quorum");
    cluster.set("final", "ok").await.unwrap();

    let ids = cluster.active_node_ids();
    assert!(
        cluster
            .wait_for_value_on(&ids, "final", "ok", Duration::from_secs(3))
            .await
    );
    for id in ids {
        let node = cluster.get_node(id).unwrap();
        assert_eq!(node.get("round0").as_deref(), Some("done"));
        assert_eq!(node.get("round1").as_deref(), Some("done"));
    }

    cluster.shutdown().await;
}

/// A lone survivor cannot commit anything
#[tokio::test]
async fn test_quorum_loss_prevents_commits() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    for id in cluster.active_node_ids() {
        if id != leader_id {
            cluster.crash_node(id).await;
        }
    }

    let node = cluster.get_node(leader_id).unwrap();
    let commit_before = node.commit_index().await;
    let index = cluster.set_on(leader_id, "orphan", "1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(node.commit_index().await < index);
    assert_eq!(node.commit_index().await, commit_before);
    assert!(node.get("orphan").is_none());

    cluster.shutdown().await;
}

/// A crashed node restarts with empty volatile state and catches up
#[tokio::test]
async fn test_restarted_node_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let victim = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();

    cluster.set("a", "1").await.unwrap();
    assert!(cluster.crash_node(victim).await);

    for i in 0..10 {
        cluster.set(&format!("while_down{}", i), "x").await.unwrap();
    }

    cluster.start_node(victim).await;
    assert!(
        cluster
            .wait_for_value_on(&[victim], "while_down9", "x", Duration::from_secs(5))
            .await,
        "Restarted node should receive the entries it missed"
    );
    assert_eq!(cluster.get_node(victim).unwrap().get("a").as_deref(), Some("1"));

    assert_eventually(
        || async { cluster.verify_log_matching().await },
        Duration::from_secs(2),
        "Logs should match after catch-up",
    )
    .await;

    cluster.shutdown().await;
}

/// With a data directory, a restarted node comes back with the term, vote and
/// log it had acknowledged instead of starting over at term 0.
#[tokio::test]
async fn test_restart_from_disk_resumes_term_and_log() {
    let data_dir = tempfile::tempdir().unwrap();
    let base = data_dir.path().to_path_buf();
    let mut cluster = TestCluster::with_config(3, |c| {
        c.snapshot.dir = Some(base.join(format!("node{}", c.node_id)));
    })
    .await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let victim = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();

    let mut last = 0;
    for i in 0..5 {
        last = cluster.set(&format!("k{}", i), "v").await.unwrap();
    }
    assert!(cluster.wait_for_applied_on(&[victim], last, Duration::from_secs(3)).await);

    let node = cluster.get_node(victim).unwrap();
    let (term, voted_for, log_len) = {
        let state = node.raft_node.state.lock().await;
        (state.current_term, state.voted_for, state.last_log_index())
    };
    assert!(log_len >= last);

    assert!(cluster.crash_node(victim).await);
    cluster.isolate_node(victim);
    cluster.start_node(victim).await;

    let node = cluster.get_node(victim).unwrap();
    {
        let state = node.raft_node.state.lock().await;
        assert_eq!(state.current_term, term);
        assert_eq!(state.voted_for, voted_for);
        assert_eq!(state.last_log_index(), log_len);
    }

    cluster.heal_node(victim);
    assert!(
        cluster
            .wait_for_value_on(&[victim], "k4", "v", Duration::from_secs(5))
            .await,
        "Restarted node should re-apply its recovered entries"
    );

    cluster.shutdown().await;
}
