use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tidelog::{
    Config, DistributedLog, LogError, MemberEvent, MembershipAdapter, Record, StreamLayer,
};

fn cluster_config(id: usize) -> Config {
    let mut config = Config::default();
    config.raft.local_id = id.to_string();
    config.raft.heartbeat_timeout = Duration::from_millis(100);
    config.raft.election_timeout = Duration::from_millis(150);
    config.raft.leader_lease_timeout = Duration::from_millis(100);
    config.raft.commit_timeout = Duration::from_secs(1);
    config.raft.bootstrap = id == 0;
    config
}

async fn start_cluster(count: usize) -> (Vec<Arc<DistributedLog>>, Vec<TempDir>, Vec<String>) {
    let mut logs: Vec<Arc<DistributedLog>> = Vec::new();
    let mut dirs = Vec::new();
    let mut addrs = Vec::new();
    for i in 0..count {
        let dir = tempfile::tempdir().unwrap();
        let stream_layer = StreamLayer::bind("127.0.0.1:0").await.unwrap();
        let addr = stream_layer.local_addr().unwrap().to_string();
        let log = Arc::new(
            DistributedLog::open(dir.path(), cluster_config(i), stream_layer).unwrap(),
        );
        if i == 0 {
            log.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        } else {
            logs[0].join(&i.to_string(), &addr).await.unwrap();
        }
        logs.push(log);
        dirs.push(dir);
        addrs.push(addr);
    }
    (logs, dirs, addrs)
}

async fn eventually<F: FnMut() -> bool>(wait: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn replicates_appends_across_three_nodes() {
    let (logs, _dirs, _addrs) = start_cluster(3).await;

    for (i, value) in ["first", "second"].iter().enumerate() {
        let offset = logs[0].append(Record::new(*value)).await.unwrap();
        assert_eq!(offset, i as u64);

        let replicated = eventually(Duration::from_millis(500), || {
            logs.iter().all(|log| match log.read(offset) {
                Ok(record) => record.value == value.as_bytes() && record.offset == offset,
                Err(_) => false,
            })
        })
        .await;
        assert!(replicated, "record {value:?} did not reach every node");
    }

    let servers = logs[0].get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert!(servers[0].is_leader);
    assert!(!servers[1].is_leader);
    assert!(!servers[2].is_leader);

    // Membership events arrive through the adapter; a leave stops
    // replication to the removed node but not to the rest.
    let adapter = MembershipAdapter::new(Arc::clone(&logs[0]));
    adapter
        .handle_event(MemberEvent::Left {
            id: "1".to_string(),
        })
        .await;

    let removed = {
        let leader = Arc::clone(&logs[0]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let servers = leader.get_servers().await.unwrap();
            if servers.len() == 2 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    assert!(removed, "node 1 was not removed from the configuration");

    let offset = logs[0].append(Record::new("third")).await.unwrap();
    assert_eq!(offset, 2);

    let reached = eventually(Duration::from_millis(500), || {
        matches!(logs[2].read(offset), Ok(record) if record.value == b"third")
    })
    .await;
    assert!(reached, "third record did not reach node 2");

    match logs[1].read(offset) {
        Err(LogError::OffsetOutOfRange(off)) => assert_eq!(off, offset),
        other => panic!("removed node should not hold offset {offset}: {other:?}"),
    }

    for log in &logs {
        log.close().await.unwrap();
    }
}

#[tokio::test]
async fn rejects_appends_on_followers() {
    let (logs, _dirs, _addrs) = start_cluster(2).await;

    // Give the follower a moment to learn who leads.
    let knows_leader = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let servers = logs[1].get_servers().await.unwrap();
            if servers.iter().any(|s| s.is_leader) {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    assert!(knows_leader);

    match logs[1].append(Record::new("nope")).await {
        Err(tidelog::RaftError::NotLeader { leader }) => {
            assert_eq!(leader.as_deref(), Some("0"));
        }
        other => panic!("expected not-leader, got {other:?}"),
    }

    for log in &logs {
        log.close().await.unwrap();
    }
}

#[tokio::test]
async fn restart_restores_snapshot_and_replays_entries() {
    let dir = tempfile::tempdir().unwrap();

    {
        let stream_layer = StreamLayer::bind("127.0.0.1:0").await.unwrap();
        let log = DistributedLog::open(dir.path(), cluster_config(0), stream_layer).unwrap();
        log.wait_for_leader(Duration::from_secs(3)).await.unwrap();

        for i in 0..5 {
            log.append(Record::new(format!("pre-{i}"))).await.unwrap();
        }
        log.snapshot().await.unwrap();
        for i in 5..7 {
            log.append(Record::new(format!("post-{i}"))).await.unwrap();
        }
        log.close().await.unwrap();
    }

    let stream_layer = StreamLayer::bind("127.0.0.1:0").await.unwrap();
    let log = DistributedLog::open(dir.path(), cluster_config(0), stream_layer).unwrap();
    log.wait_for_leader(Duration::from_secs(3)).await.unwrap();

    let rebuilt = eventually(Duration::from_secs(2), || {
        (0..7).all(|offset| log.read(offset).is_ok())
    })
    .await;
    assert!(rebuilt, "restart did not rebuild all records");

    for i in 0..5u64 {
        assert_eq!(log.read(i).unwrap().value, format!("pre-{i}").as_bytes());
    }
    for i in 5..7u64 {
        assert_eq!(log.read(i).unwrap().value, format!("post-{i}").as_bytes());
    }

    // The log keeps assigning offsets where it left off.
    let offset = log.append(Record::new("after-restart")).await.unwrap();
    assert_eq!(offset, 7);

    log.close().await.unwrap();
}
