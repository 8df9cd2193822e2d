//! End-to-end consensus tests over the in-memory cluster.
//!
//! Validators run on a real runtime with scaled-down timeouts, so the
//! assertions are about eventual outcomes with generous deadlines.

use std::time::Duration;
use strata_simulation::{ClusterConfig, SimulationCluster};
use tracing_test::traced_test;

const DEADLINE: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_four_validators_commit_the_same_chain() {
    let cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();

    assert!(
        cluster.wait_for_height(&[0, 1, 2, 3], 5, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.chains_agree());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_submitted_transactions_are_included_everywhere() {
    let cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();
    let txs: Vec<Vec<u8>> = (0..10u8).map(|i| vec![b't', i]).collect();
    for tx in &txs {
        cluster.submit_transaction(tx.clone());
    }

    let included = cluster
        .wait_for(DEADLINE, |cluster| {
            cluster.nodes().iter().all(|node| {
                let committed = node.chain().transactions();
                txs.iter().all(|tx| committed.contains(tx))
            })
        })
        .await;
    assert!(included, "heights: {:?}", cluster.committed_heights());
    assert!(cluster.chains_agree());

    // Each transaction is committed once, and no longer queued.
    for node in cluster.nodes() {
        let committed = node.chain().transactions();
        for tx in &txs {
            assert_eq!(committed.iter().filter(|c| *c == tx).count(), 1);
        }
        assert!(node.queue().is_empty());
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_stopped_primary_is_replaced_by_revolt() {
    let mut cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();
    // Node 1 is primary for round 0 at heights 1 and 5.
    cluster.stop_node(1).await;

    assert!(
        cluster.wait_for_height(&[0, 2, 3], 6, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.node(1).chain().height() < 2);
    assert!(cluster.chains_agree());
    for index in [0, 2, 3] {
        assert!(cluster.node(index).stats().view_changes > 0);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_isolated_validator_catches_up_after_heal() {
    let cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();
    cluster.network().isolate_node(3);

    assert!(
        cluster.wait_for_height(&[0, 1, 2], 4, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.node(3).chain().height() < 4);

    cluster.network().heal_all();
    let target = cluster.node(0).chain().height();
    assert!(
        cluster.wait_for_height(&[3], target, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.chains_agree());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_build_failures_do_not_stall_the_chain() {
    let cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();
    for node in cluster.nodes() {
        node.faults().fail_next_builds(2);
    }

    assert!(
        cluster.wait_for_height(&[0, 1, 2, 3], 4, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.chains_agree());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_commits_survive_packet_loss() {
    let cluster = SimulationCluster::start(ClusterConfig::default()).unwrap();
    cluster.network().set_packet_loss_rate(0.2);

    assert!(
        cluster.wait_for_height(&[0, 1, 2, 3], 3, DEADLINE).await,
        "heights: {:?}",
        cluster.committed_heights()
    );
    assert!(cluster.chains_agree());
    assert!(cluster.network().dropped_count() > 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_validator_builds_alone() {
    let cluster = SimulationCluster::start(ClusterConfig::default().with_node_count(1)).unwrap();
    assert!(cluster.wait_for_height(&[0], 3, DEADLINE).await);
    cluster.shutdown().await;
}
