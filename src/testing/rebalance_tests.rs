//! Multi-node rebalance scenarios.

use super::*;
use crate::config::{CacheMode, MergePolicy, StateTransferConfig};
use crate::container::DataContainer;
use crate::topology::Phase;
use crate::types::CacheEntry;
use bytes::Bytes;
use std::time::Duration;

const NUM_SEGMENTS: u32 = 6;

fn config() -> StateTransferConfig {
    StateTransferConfig::new("scenarios")
        .with_num_segments(NUM_SEGMENTS)
        .with_num_owners(2)
        .with_chunk_size(4)
        .with_timeout(Duration::from_secs(5))
        .with_join_timeout(Duration::from_secs(10))
}

fn value(v: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(v.as_bytes()))
}

/// Every key is held by exactly the owners of its segment.
fn placement_matches(cluster: &TestCluster, keys: &[String]) -> bool {
    keys.iter().all(|k| {
        let owners = cluster.owners_of(k);
        cluster
            .nodes()
            .all(|n| cluster.get(n.id, k).is_some() == owners.contains(&n.id))
    })
}

#[test_log::test(tokio::test)]
async fn test_cluster_formation_places_every_key() {
    let cluster = TestCluster::start(config(), 3).await.unwrap();
    let topology = cluster.wait_for_stable().await.unwrap();
    assert_eq!(topology.current_ch.members(), &[1, 2, 3]);
    assert!(cluster.nodes().all(|n| n.manager.is_join_complete()));

    let keys: Vec<String> = (0..30).map(|i| format!("k{i}")).collect();
    for k in &keys {
        cluster.put(k, "v").await.unwrap();
    }
    assert!(placement_matches(&cluster, &keys));
}

#[test_log::test(tokio::test)]
async fn test_leave_moves_segments_to_new_owners() {
    let mut cluster = TestCluster::start(config(), 4).await.unwrap();

    // segment 2: {3, 4} before, {3, 1} after node 4 leaves
    let moved = cluster.keys_in_segment(2, 5);
    // segment 4: {1, 2} before, {2, 3} after
    let dropped = cluster.keys_in_segment(4, 5);
    for k in moved.iter().chain(&dropped) {
        cluster.put(k, "before-leave").await.unwrap();
    }
    assert!(moved.iter().all(|k| cluster.get(4, k).is_some()));
    assert!(moved.iter().all(|k| cluster.get(1, k).is_none()));

    cluster.leave(4).await.unwrap();
    let topology = cluster.wait_for_stable().await.unwrap();
    assert_eq!(topology.current_ch.locate_owners(2), &[3, 1]);
    assert_eq!(topology.current_ch.locate_owners(4), &[2, 3]);

    for k in &moved {
        assert_eq!(cluster.get(1, k), value("before-leave"));
        assert_eq!(cluster.get(3, k), value("before-leave"));
    }
    for k in &dropped {
        assert_eq!(cluster.get(3, k), value("before-leave"));
    }
    let purged = wait_until(
        || dropped.iter().all(|k| cluster.get(1, k).is_none()),
        SETTLE_TIMEOUT,
    )
    .await;
    assert!(purged, "node 1 kept entries of a segment it no longer owns");
}

#[test_log::test(tokio::test)]
async fn test_crash_recovers_from_surviving_owner() {
    let mut cluster = TestCluster::start(config(), 3).await.unwrap();
    let keys: Vec<String> = (0..40).map(|i| format!("k{i}")).collect();
    for k in &keys {
        cluster.put(k, "v").await.unwrap();
    }

    cluster.crash(3).await.unwrap();
    cluster.wait_for_stable().await.unwrap();

    // two owners per segment and two survivors: both hold everything
    for k in &keys {
        assert_eq!(cluster.get(1, k), value("v"), "node 1 missing {k}");
        assert_eq!(cluster.get(2, k), value("v"), "node 2 missing {k}");
    }
    let lost: u64 = cluster
        .nodes()
        .map(|n| n.manager.metrics().snapshot().segments_lost)
        .sum();
    assert_eq!(lost, 0);
}

#[test_log::test(tokio::test)]
async fn test_join_rebalances_existing_data() {
    let mut cluster = TestCluster::start(config(), 2).await.unwrap();
    let keys: Vec<String> = (0..40).map(|i| format!("k{i}")).collect();
    for k in &keys {
        cluster.put(k, "v").await.unwrap();
    }

    cluster.join(3).await.unwrap();
    cluster.wait_for_stable().await.unwrap();

    let settled = wait_until(|| placement_matches(&cluster, &keys), SETTLE_TIMEOUT).await;
    assert!(settled, "keys are not held by exactly their owners");
    let node3 = cluster.node(3).unwrap();
    assert!(!node3.manager.is_state_transfer_in_progress());
    assert!(node3.manager.metrics().snapshot().entries_applied > 0);
}

#[test_log::test(tokio::test)]
async fn test_live_write_wins_over_transferred_value() {
    let mut cluster = TestCluster::start(config(), 2).await.unwrap();
    // segment 2 moves to node 3 when it joins
    let key = cluster.keys_in_segment(2, 1).remove(0);
    cluster.put(&key, "old").await.unwrap();

    cluster.network.hold("state_response");
    let joiner = cluster.add_node(3);
    let starting = {
        let joiner = joiner.clone();
        tokio::spawn(async move { joiner.start().await })
    };

    let fetching = wait_until(
        || joiner.is_state_transfer_in_progress_for_key(key.as_bytes()),
        SETTLE_TIMEOUT,
    )
    .await;
    assert!(fetching);
    assert_eq!(
        joiner.cache_topology().map(|t| t.phase),
        Some(Phase::ReadOldWriteAll)
    );

    cluster.put(&key, "new").await.unwrap();
    assert_eq!(cluster.get(3, &key), value("new"));

    cluster.network.release("state_response");
    starting.await.unwrap().unwrap();
    cluster.wait_for_stable().await.unwrap();

    assert_eq!(cluster.get(3, &key), value("new"));
    assert_eq!(cluster.get(1, &key), value("new"));
    assert!(joiner.metrics().snapshot().entries_discarded >= 1);
}

#[test_log::test(tokio::test)]
async fn test_empty_segments_complete_with_terminal_chunks() {
    let mut cluster = TestCluster::start(config(), 1).await.unwrap();
    cluster.join(2).await.unwrap();
    cluster.wait_for_stable().await.unwrap();

    let snapshot = cluster.node(2).unwrap().manager.metrics().snapshot();
    assert_eq!(snapshot.segments_requested, NUM_SEGMENTS as u64);
    assert_eq!(snapshot.segments_completed, NUM_SEGMENTS as u64);
    assert_eq!(snapshot.entries_applied, 0);
    assert_eq!(snapshot.segments_lost, 0);
}

#[test_log::test(tokio::test)]
async fn test_replicated_join_copies_everything() {
    let config = config().with_cache_mode(CacheMode::Replicated);
    let mut cluster = TestCluster::start(config, 2).await.unwrap();
    let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
    for k in &keys {
        cluster.put(k, "v").await.unwrap();
    }

    cluster.join(3).await.unwrap();
    cluster.wait_for_stable().await.unwrap();
    for k in &keys {
        assert_eq!(cluster.get(3, k), value("v"));
    }
}

#[test_log::test(tokio::test)]
async fn test_transactional_join_completes() {
    let config = config().with_transactional(true);
    let mut cluster = TestCluster::start(config, 2).await.unwrap();
    let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    for k in &keys {
        cluster.put(k, "v").await.unwrap();
    }

    cluster.join(3).await.unwrap();
    cluster.wait_for_stable().await.unwrap();
    let settled = wait_until(|| placement_matches(&cluster, &keys), SETTLE_TIMEOUT).await;
    assert!(settled);
}

#[test_log::test(tokio::test)]
async fn test_conflict_resolution_converges_owners() {
    let config = config().with_merge_policy(MergePolicy::PreferNonNull);
    let cluster = TestCluster::start(config, 2).await.unwrap();
    let diverged = cluster.keys_in_segment(0, 1).remove(0);
    let only_on_2 = cluster.keys_in_segment(1, 1).remove(0);
    let container = |id| cluster.node(id).unwrap().container.clone();

    // Copies written behind the cluster's back, as after a partition.
    container(1).put(CacheEntry::new(diverged.clone(), "from-1"));
    container(2).put(CacheEntry::new(diverged.clone(), "from-2"));
    container(2).put(CacheEntry::new(only_on_2.clone(), "kept"));

    cluster.coordinator.resolve_conflicts().await.unwrap();
    cluster.wait_for_stable().await.unwrap();

    let primary = cluster.owners_of(&diverged)[0];
    let winner = cluster.get(primary, &diverged);
    assert!(winner.is_some());
    assert_eq!(cluster.get(1, &diverged), winner);
    assert_eq!(cluster.get(2, &diverged), winner);
    assert_eq!(cluster.get(1, &only_on_2), value("kept"));
    assert_eq!(cluster.get(2, &only_on_2), value("kept"));

    let resolved: u64 = cluster
        .nodes()
        .map(|n| n.manager.metrics().snapshot().conflicts_resolved)
        .sum();
    assert_eq!(resolved, 2);
}
