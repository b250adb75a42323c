//! Three-node clusters over the in-memory network

mod common;

use chronodb::metadata::{
    ApplyOutcome, MetadataCommand, Proposal, ShardSpace, DEFAULT_SPACE, ROOT_USER,
};
use chronodb::raft::EntryKind;
use chronodb::router::{QueryRequest, WriteRequest};
use chronodb::storage::{FieldValue, SeriesPoint};
use chronodb::{Error, Node, NodeOptions};
use common::{addr, test_config, wait_until, TestCluster};
use futures_util::future::join_all;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

async fn create_metrics(cluster: &TestCluster, replication: usize) {
    let leader = cluster.wait_leader().await;
    leader
        .meta()
        .create_database("metrics", ShardSpace::new(DEFAULT_SPACE, HOUR, replication))
        .await
        .unwrap();
    let visible = wait_until(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.meta().store().database("metrics").is_ok())
    })
    .await;
    assert!(visible, "database not replicated");
}

fn cpu(timestamp: i64, value: f64) -> SeriesPoint {
    SeriesPoint::with_field("cpu", timestamp, "value", FieldValue::Float(value))
}

fn write_cpu(timestamp: i64, value: f64) -> WriteRequest {
    WriteRequest {
        database: "metrics".into(),
        points: vec![cpu(timestamp, value)],
    }
}

/// Points of `cpu` this node holds locally for `shard`
fn local_cpu(node: &Node, shard: u64) -> usize {
    node.shards()
        .scan(shard, &["cpu".to_string()], 0, 200)
        .unwrap()
        .len()
}

async fn query_until(node: &Node, expected: usize) -> Vec<SeriesPoint> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let request = QueryRequest {
            database: "metrics".into(),
            series: vec!["cpu".into()],
            start: 0,
            end: 200,
        };
        if let Ok(response) = node.router().query(request).await {
            if response.points("cpu").len() == expected || tokio::time::Instant::now() > deadline {
                return response.points("cpu").to_vec();
            }
        } else if tokio::time::Instant::now() > deadline {
            return Vec::new();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_visible_from_every_node() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 3).await;

    let summary = cluster
        .node(2)
        .router()
        .write(WriteRequest {
            database: "metrics".into(),
            points: vec![cpu(100, 0.5)],
        })
        .await
        .unwrap();
    assert_eq!(summary.points, 1);
    assert_eq!(summary.shards.len(), 1);
    assert!(summary.shards[0].acked >= 2);
    assert_eq!(summary.shards[0].replicas, 3);

    for node in &cluster.nodes {
        let points = query_until(node, 1).await;
        assert_eq!(points.len(), 1, "node {}", node.config().node_id);
        assert_eq!(points[0].timestamp, 100);
        assert_eq!(points[0].fields.get("value"), Some(&FieldValue::Float(0.5)));
    }

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_quorum_enforced() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 3).await;

    let write = |ts: i64| WriteRequest {
        database: "metrics".into(),
        points: vec![cpu(ts, 1.0)],
    };
    let router = cluster.node(1).router();

    // Creates the shard while everyone is reachable
    router.write(write(100)).await.unwrap();

    cluster.net.cut(&addr(1), &addr(3));
    let summary = router.write(write(101)).await.unwrap();
    assert_eq!(summary.shards[0].acked, 2);

    cluster.net.isolate(&addr(1));
    match router.write(write(102)).await {
        Err(Error::QuorumNotReached { needed, acked, .. }) => {
            assert_eq!(needed, 2);
            assert_eq!(acked, 1);
        }
        other => panic!("expected QuorumNotReached, got {:?}", other),
    }

    cluster.net.heal();
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_after_partition_applies_once() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    let old_leader = cluster.wait_leader().await;
    let old_id = old_leader.config().node_id;

    let proposal = Proposal::new(MetadataCommand::CreateDatabase {
        name: "partitioned".into(),
        space: ShardSpace::new(DEFAULT_SPACE, HOUR, 1),
    });

    cluster.net.isolate(&addr(old_id));
    let err = old_leader
        .raft()
        .propose(EntryKind::Command, proposal.encode().unwrap())
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {:?}", err);

    // The majority side elects a replacement before the link comes back
    let replaced = wait_until(Duration::from_secs(10), || {
        cluster
            .nodes
            .iter()
            .any(|n| n.config().node_id != old_id && n.raft().is_leader())
    })
    .await;
    assert!(replaced, "no new leader while the old one was isolated");

    cluster.net.heal();
    let settled = wait_until(Duration::from_secs(10), || {
        matches!(cluster.leader(), Some(n) if n.config().node_id != old_id)
            && !old_leader.raft().is_leader()
    })
    .await;
    assert!(settled, "old leader still leading after heal");
    let new_id = cluster.leader().unwrap().config().node_id;
    assert_ne!(new_id, old_id);

    let other = cluster
        .nodes
        .iter()
        .find(|n| n.config().node_id != old_id)
        .unwrap();

    let first = other.meta().propose_with(proposal.clone()).await.unwrap();
    assert!(first.outcome.is_success());
    let again = other.meta().propose_with(proposal).await.unwrap();
    assert_eq!(again.outcome, ApplyOutcome::Duplicate);

    let replicated = wait_until(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.meta().store().database("partitioned").is_ok())
    })
    .await;
    assert!(replicated);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bootstrap_creates_one_admin() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;

    for node in &cluster.nodes {
        let snapshot = node.meta().store().snapshot();
        let admins = snapshot.users.values().filter(|u| u.is_admin).count();
        assert_eq!(admins, 1, "node {}", node.config().node_id);
    }

    let user = cluster
        .node(3)
        .meta()
        .authenticate("root", "root")
        .await
        .unwrap();
    assert!(user.is_admin);
    assert!(cluster
        .node(3)
        .meta()
        .authenticate("root", "wrong")
        .await
        .is_err());

    // Running the bootstrap again changes nothing
    let outcome = cluster
        .node(2)
        .meta()
        .create_root_user_if_absent()
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Unchanged);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_joins_running_cluster() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(4, dir.path(), &[]);
    config.join = vec![addr(1)];
    let joiner = Node::open(config, NodeOptions::default(), cluster.net.transport_for(&addr(4))).unwrap();
    cluster.net.register(&addr(4), joiner.handler().clone());
    joiner.start();

    let joined = wait_until(Duration::from_secs(15), || {
        joiner.is_joined() && joiner.meta().store().snapshot().has_admin()
    })
    .await;
    assert!(joined, "node 4 did not join");

    for node in &cluster.nodes {
        let member = wait_until(Duration::from_secs(5), || {
            node.meta().store().snapshot().nodes.contains_key(&4)
        })
        .await;
        assert!(member);
    }
    assert_eq!(joiner.raft().voters().len(), 4);

    let _ = joiner.shutdown();
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_root_proposals_apply_once() {
    // Membership only: no background root bootstrap
    let cluster = TestCluster::open(3, |_| {});
    for node in &cluster.nodes {
        node.raft().start();
    }
    for joined in join_all(cluster.nodes.iter().map(|n| n.join_cluster())).await {
        joined.unwrap();
    }
    assert!(cluster
        .nodes
        .iter()
        .all(|n| !n.meta().store().snapshot().has_admin()));

    let mut tasks = Vec::new();
    for node in &cluster.nodes {
        for attempt in 0..4 {
            let meta = node.meta().clone();
            let password_hash = format!("hash-{}-{}", node.config().node_id, attempt);
            tasks.push(tokio::spawn(async move {
                let committed = meta
                    .propose(MetadataCommand::CreateRootUserIfAbsent {
                        password_hash: password_hash.clone(),
                    })
                    .await;
                (password_hash, committed)
            }));
        }
    }

    let mut applied = Vec::new();
    let mut unchanged = 0;
    for task in tasks {
        let (password_hash, committed) = task.await.unwrap();
        match committed.unwrap().outcome {
            ApplyOutcome::Applied => applied.push(password_hash),
            ApplyOutcome::Unchanged => unchanged += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(applied.len(), 1, "winners: {:?}", applied);
    assert_eq!(unchanged, 11);

    let agreed = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|n| {
            let meta = n.meta().store().snapshot();
            meta.users.values().filter(|u| u.is_admin).count() == 1
                && meta.users.get(ROOT_USER).map(|u| u.password_hash.as_str())
                    == Some(applied[0].as_str())
        })
    })
    .await;
    assert!(agreed, "nodes disagree on the admin");

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missed_replica_write_is_read_and_delivered() {
    // Replay only when asked
    let cluster = TestCluster::start_with(3, |c| c.cluster.hint_interval_ms = 600_000).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 3).await;

    let router = cluster.node(1).router();
    let summary = router.write(write_cpu(50, 0.5)).await.unwrap();
    let shard = summary.shards[0].shard;

    cluster.net.isolate(&addr(3));
    let summary = router.write(write_cpu(100, 1.0)).await.unwrap();
    assert_eq!(summary.shards[0].acked, 2);
    let hinted = wait_until(Duration::from_secs(5), || {
        router.hints().len().unwrap() == 1
    })
    .await;
    assert!(hinted, "missed write was not hinted");
    cluster.net.heal();

    // Node 3 lacks the point locally but a quorum read through it sees it
    assert_eq!(local_cpu(cluster.node(3), shard), 1);
    let points = query_until(cluster.node(3), 2).await;
    assert_eq!(
        points.iter().map(|p| p.timestamp).collect::<Vec<_>>(),
        vec![50, 100]
    );

    assert_eq!(router.replay_hints().await.unwrap(), 1);
    assert_eq!(local_cpu(cluster.node(3), shard), 2);
    assert!(router.hints().is_empty().unwrap());
    assert_eq!(router.replay_hints().await.unwrap(), 0);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hints_replay_in_background() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 3).await;

    let router = cluster.node(2).router();
    let shard = router.write(write_cpu(10, 0.1)).await.unwrap().shards[0].shard;

    cluster.net.cut(&addr(2), &addr(1));
    router.write(write_cpu(20, 0.2)).await.unwrap();
    cluster.net.heal();

    let delivered = wait_until(Duration::from_secs(10), || {
        local_cpu(cluster.node(1), shard) == 2 && router.hints().is_empty().unwrap()
    })
    .await;
    assert!(delivered, "hint never reached node 1");

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let cluster = TestCluster::start_with(3, |c| c.raft.snapshot_threshold = 5).await;
    cluster.wait_ready().await;
    let leader_id = cluster.wait_leader().await.config().node_id;
    let lagging_id = (1..=3).find(|&id| id != leader_id).unwrap();

    cluster.net.isolate(&addr(lagging_id));
    for i in 0..15 {
        cluster
            .node(leader_id)
            .meta()
            .create_database(&format!("db{}", i), ShardSpace::new(DEFAULT_SPACE, HOUR, 1))
            .await
            .unwrap();
    }

    let compacted = wait_until(Duration::from_secs(5), || {
        cluster.node(leader_id).raft().status().snapshot_index
            > cluster.node(lagging_id).raft().status().last_index
    })
    .await;
    assert!(compacted, "leader log not compacted past the follower");
    let snapshot_index = cluster.node(leader_id).raft().status().snapshot_index;

    cluster.net.heal();
    let caught_up = wait_until(Duration::from_secs(15), || {
        let ours = cluster.node(lagging_id).meta().store().snapshot();
        let theirs = cluster.node(leader_id).meta().store().snapshot();
        ours.databases.len() == 16
            && ours.databases == theirs.databases
            && ours.users == theirs.users
            && ours.nodes == theirs.nodes
    })
    .await;
    assert!(caught_up, "follower metadata did not converge");
    assert!(cluster.node(lagging_id).raft().status().snapshot_index >= snapshot_index);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_administration() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 2).await;
    let meta = cluster.node(2).meta();

    // Extra shard space that becomes the default
    let fine = ShardSpace::new("fine", Duration::from_secs(60), 2);
    let committed = meta.create_shard_space("metrics", fine.clone(), true).await.unwrap();
    assert_eq!(committed.outcome, ApplyOutcome::Applied);
    let again = meta.create_shard_space("metrics", fine, true).await.unwrap();
    assert_eq!(again.outcome, ApplyOutcome::Unchanged);
    let switched = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|n| {
            n.meta()
                .store()
                .database("metrics")
                .map(|db| db.default_space == "fine")
                .unwrap_or(false)
        })
    })
    .await;
    assert!(switched);

    // Users
    meta.create_user("alice", "s3cret", false).await.unwrap();
    meta.change_password("alice", "n3w").await.unwrap();
    assert!(meta.authenticate("alice", "n3w").await.is_ok());
    assert!(meta.authenticate("alice", "s3cret").await.is_err());
    assert!(matches!(
        meta.change_password("nobody", "x").await,
        Err(Error::Rejected(_))
    ));

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_moved_replica_serves_existing_points() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    create_metrics(&cluster, 2).await;

    let router = cluster.node(1).router();
    let summary = router.write(write_cpu(100, 1.0)).await.unwrap();
    let shard_id = summary.shards[0].shard;
    let shard = cluster.node(1).meta().store().shard(shard_id).unwrap();
    let spare = (1..=3).find(|id| !shard.replicas.contains(id)).unwrap();
    let kept = shard.replicas[0];
    let dropped = shard.replicas[1];
    assert_eq!(local_cpu(cluster.node(spare), shard_id), 0);

    let committed = router
        .set_shard_replicas(shard_id, vec![kept, spare])
        .await
        .unwrap();
    assert_eq!(committed.outcome, ApplyOutcome::Applied);
    assert_eq!(local_cpu(cluster.node(spare), shard_id), 1);

    // Reads no longer need the dropped replica
    cluster.net.isolate(&addr(dropped));
    let reader = cluster.node(spare);
    let visible = wait_until(Duration::from_secs(5), || {
        reader
            .meta()
            .store()
            .shard(shard_id)
            .map(|s| s.replicas == vec![kept, spare])
            .unwrap_or(false)
    })
    .await;
    assert!(visible);
    let points = query_until(reader, 1).await;
    assert_eq!(points.len(), 1);

    cluster.net.heal();
    assert!(matches!(
        router.set_shard_replicas(shard_id, vec![]).await,
        Err(Error::Rejected(_))
    ));

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removed_node_leaves_the_voters() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_ready().await;
    let leader_id = cluster.wait_leader().await.config().node_id;
    let victim = (1..=3).rev().find(|&id| id != leader_id).unwrap();
    let survivors: Vec<u64> = (1..=3).filter(|&id| id != victim).collect();

    let committed = cluster.node(leader_id).meta().remove_node(victim).await.unwrap();
    assert_eq!(committed.outcome, ApplyOutcome::Applied);
    cluster.net.isolate(&addr(victim));

    let shrunk = wait_until(Duration::from_secs(5), || {
        survivors.iter().all(|&id| {
            let voters = cluster.node(id).raft().voters();
            voters.len() == 2 && voters.iter().all(|p| p.id != victim)
        })
    })
    .await;
    assert!(shrunk, "voter set did not shrink");

    // Two voters still make progress
    let survivor = cluster.node(survivors[0]);
    survivor
        .meta()
        .create_database("after", ShardSpace::new(DEFAULT_SPACE, HOUR, 2))
        .await
        .unwrap();
    let missing = survivor.meta().remove_node(victim).await.unwrap();
    assert_eq!(missing.outcome, ApplyOutcome::Unchanged);

    cluster.net.heal();
    cluster.shutdown();
}
