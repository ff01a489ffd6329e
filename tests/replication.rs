//! Cluster-level replication behaviour over the in-process router

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{eventually, fast_config, identity, start_cluster, start_node, TestCluster};
use wolfmeta::network::LocalRouter;
use wolfmeta::oplog::OperationLog;
use wolfmeta::replication::ReplicationConfig;
use wolfmeta::state::EngineEvent;

fn created(name: &str) -> EngineEvent {
    EngineEvent::Created(name.to_string())
}

fn dropped(name: &str) -> EngineEvent {
    EngineEvent::Dropped(name.to_string())
}

#[tokio::test]
async fn test_create_commits_with_quorum_and_reaches_everyone() {
    let cluster = start_cluster(3, 2, fast_config()).await;

    let response = cluster
        .leader()
        .node
        .create_database("X", "document", BTreeMap::new())
        .await
        .unwrap();
    assert!(response.success, "{}", response.message);
    assert!(cluster.leader().shared().exists_database("X"));

    cluster.converged().await;
    for node in &cluster.nodes {
        assert_eq!(node.cluster.engine_events(), vec![created("X")]);
        assert_eq!(node.shared().database("X").unwrap().db_type, "document");
    }
}

#[tokio::test]
async fn test_no_quorum_without_acks() {
    let cluster = start_cluster(3, 3, fast_config()).await;
    let leader = cluster.leader().identity().clone();
    cluster.router.block(cluster.nodes[2].identity(), &leader);

    let response = cluster
        .leader()
        .node
        .create_database("X", "graph", BTreeMap::new())
        .await
        .unwrap();
    assert!(!response.success);
    assert!(cluster.leader().cluster.engine_events().is_empty());
}

#[tokio::test]
async fn test_lagging_follower_catches_up_in_order() {
    let cluster = start_cluster(3, 2, fast_config()).await;
    let leader = cluster.leader().identity().clone();
    let lagging = cluster.nodes[2].identity().clone();

    cluster.router.block(&leader, &lagging);
    for name in ["A", "B", "C"] {
        let response = cluster
            .leader()
            .node
            .create_database(name, "graph", BTreeMap::new())
            .await
            .unwrap();
        assert!(response.success);
    }
    assert!(cluster.nodes[2].cluster.engine_events().is_empty());

    cluster.router.unblock(&leader, &lagging);
    cluster.converged().await;

    assert_eq!(
        cluster.nodes[2].cluster.engine_events(),
        vec![created("A"), created("B"), created("C")]
    );
    assert_eq!(
        cluster.nodes[2].oplog.last_persistent_log(),
        cluster.leader().oplog.last_persistent_log()
    );
}

#[tokio::test]
async fn test_gap_detected_on_next_proposal_heals() {
    // Announcements effectively off: only the log gap can trigger the resync
    let config = ReplicationConfig {
        ping_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let cluster = start_cluster(3, 2, config).await;
    let leader = cluster.leader().identity().clone();
    let lagging = cluster.nodes[2].identity().clone();

    cluster.router.block(&leader, &lagging);
    for name in ["D1", "D2"] {
        cluster
            .leader()
            .node
            .create_database(name, "graph", BTreeMap::new())
            .await
            .unwrap();
    }
    cluster.router.unblock(&leader, &lagging);

    cluster
        .leader()
        .node
        .create_database("D3", "graph", BTreeMap::new())
        .await
        .unwrap();

    cluster.converged().await;
    assert_eq!(
        cluster.nodes[2].cluster.engine_events(),
        vec![created("D1"), created("D2"), created("D3")]
    );
}

#[tokio::test]
async fn test_concurrent_drops_succeed_once() {
    let cluster = start_cluster(3, 2, fast_config()).await;
    cluster
        .leader()
        .node
        .create_database("X", "graph", BTreeMap::new())
        .await
        .unwrap();
    cluster.converged().await;

    let (first, second) = tokio::join!(
        cluster.leader().node.drop_database("X"),
        cluster.nodes[1].node.drop_database("X"),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.success ^ second.success);
    let failure = if first.success { &second } else { &first };
    assert!(failure.message.contains("does not exist"));

    cluster.converged().await;
    for node in &cluster.nodes {
        assert!(!node.shared().exists_database("X"));
        assert_eq!(node.cluster.engine_events(), vec![created("X"), dropped("X")]);
    }
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once() {
    let cluster = start_cluster(3, 2, fast_config()).await;
    cluster.router.set_duplicate(true);

    for (create, name) in [(true, "A"), (true, "B"), (false, "A"), (true, "C")] {
        let response = if create {
            cluster
                .leader()
                .node
                .create_database(name, "graph", BTreeMap::new())
                .await
        } else {
            cluster.leader().node.drop_database(name).await
        }
        .unwrap();
        assert!(response.success, "{}", response.message);
    }

    cluster.converged().await;
    for node in &cluster.nodes {
        assert_eq!(
            node.cluster.engine_events(),
            vec![created("A"), created("B"), dropped("A"), created("C")]
        );
        let names: Vec<_> = node.shared().databases().keys().cloned().collect();
        assert_eq!(names, vec!["B".to_string(), "C".to_string()]);
    }
}

#[tokio::test]
async fn test_conflicts_consume_no_log_id() {
    let cluster = start_cluster(3, 2, fast_config()).await;
    let leader = cluster.leader();

    assert!(leader
        .node
        .create_database("X", "graph", BTreeMap::new())
        .await
        .unwrap()
        .success);
    let last = leader.oplog.last_persistent_log();

    let again = leader
        .node
        .create_database("X", "graph", BTreeMap::new())
        .await
        .unwrap();
    assert!(!again.success);
    assert!(again.message.contains("already exists"));

    // Relayed through a follower
    let relayed = cluster.nodes[1].node.drop_database("missing").await.unwrap();
    assert!(!relayed.success);

    assert_eq!(leader.oplog.last_persistent_log(), last);
}

#[tokio::test]
async fn test_follower_reads_its_own_write() {
    let cluster = start_cluster(3, 2, fast_config()).await;
    let follower = &cluster.nodes[2];

    let response = follower
        .node
        .create_database("R", "document", BTreeMap::new())
        .await
        .unwrap();
    assert!(response.success, "{}", response.message);
    // Visible locally as soon as the call returns
    assert!(follower.shared().exists_database("R"));
    assert_eq!(follower.cluster.engine_events(), vec![created("R")]);

    let dropped_response = follower.node.drop_database("R").await.unwrap();
    assert!(dropped_response.success);
    assert!(!follower.shared().exists_database("R"));

    eventually("the other follower sees the drop", || {
        !cluster.nodes[1].shared().exists_database("R")
            && cluster.nodes[1].cluster.engine_events().len() == 2
    })
    .await;
}

#[tokio::test]
async fn test_rejects_node_name_taken_by_another_id() {
    let cluster = start_cluster(2, 0, fast_config()).await;
    let impostor = wolfmeta::id::NodeIdentity::new("id-other", "node-1");
    let wolfmeta::node::Role::Leader(leader) = cluster.leader().node.role() else {
        panic!("node 0 leads");
    };

    assert!(leader.join(impostor.clone()).await.is_err());
    assert!(!cluster.leader().shared().exists_node(&impostor));
    assert_eq!(cluster.leader().shared().nodes().len(), 2);
}

#[tokio::test]
async fn test_followers_started_before_leader_still_count_toward_quorum() {
    let router = LocalRouter::new();

    // Followers announce while the leader is not reachable yet
    let followers: Vec<_> = (1..3)
        .map(|index| start_node(&router, index, 0, fast_config()))
        .collect();
    for follower in &followers {
        follower.node.announce(&[]).await.unwrap();
    }

    let leader = start_node(&router, 0, 0, fast_config());
    leader.node.announce(&[identity(1), identity(2)]).await.unwrap();

    let mut nodes = vec![leader];
    nodes.extend(followers);
    let cluster = TestCluster { router, nodes };
    eventually("every node registers", || {
        cluster.leader().shared().nodes().len() == 3
    })
    .await;
    assert_eq!(cluster.leader().shared().quorum(), 2);

    let leader_id = cluster.leader().identity().clone();
    for follower in &cluster.nodes[1..] {
        cluster.router.block(follower.identity(), &leader_id);
    }
    let response = cluster
        .leader()
        .node
        .create_database("X", "graph", BTreeMap::new())
        .await
        .unwrap();
    assert!(!response.success);
    assert!(cluster.leader().cluster.engine_events().is_empty());
}
