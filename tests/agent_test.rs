use std::time::Duration;

use tempfile::TempDir;
use tidelog::{Agent, AgentConfig, Client, ClientError, Config};

fn agent_config(name: &str, bootstrap: bool, dir: &TempDir) -> AgentConfig {
    let mut config = Config::default();
    config.raft.heartbeat_timeout = Duration::from_millis(100);
    config.raft.election_timeout = Duration::from_millis(150);
    config.raft.leader_lease_timeout = Duration::from_millis(100);
    config.raft.commit_timeout = Duration::from_secs(1);
    AgentConfig {
        data_dir: dir.path().to_path_buf(),
        bind_addr: "127.0.0.1:0".to_string(),
        node_name: name.to_string(),
        bootstrap,
        config,
    }
}

async fn start_agents(count: usize) -> (Vec<Agent>, Vec<TempDir>) {
    let mut agents: Vec<Agent> = Vec::new();
    let mut dirs = Vec::new();
    for i in 0..count {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(agent_config(&format!("node-{i}"), i == 0, &dir))
            .await
            .unwrap();
        if i > 0 {
            agents[0]
                .log()
                .join(&format!("node-{i}"), agent.rpc_addr())
                .await
                .unwrap();
        }
        agents.push(agent);
        dirs.push(dir);
    }
    (agents, dirs)
}

#[tokio::test]
async fn produce_and_consume_across_agents() {
    let (agents, _dirs) = start_agents(3).await;

    let mut leader_client = Client::connect(agents[0].rpc_addr()).await.unwrap();
    let offset = leader_client.produce("foo").await.unwrap();
    assert_eq!(offset, 0);

    assert_eq!(leader_client.consume(0).await.unwrap(), b"foo");

    // Followers serve the record once replication catches up.
    let mut follower_client = Client::connect(agents[2].rpc_addr()).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match follower_client.consume(0).await {
            Ok(value) => {
                assert_eq!(value, b"foo");
                break;
            }
            Err(ClientError::OffsetOutOfRange) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(e) => panic!("consume from follower failed: {e}"),
        }
    }

    match follower_client.consume(1).await {
        Err(ClientError::OffsetOutOfRange) => {}
        other => panic!("expected out of range, got {other:?}"),
    }

    let servers = leader_client.get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    for agent in &agents {
        agent.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn consume_stream_follows_the_log() {
    let (agents, _dirs) = start_agents(1).await;
    let addr = agents[0].rpc_addr().to_string();

    let mut producer = Client::connect(&addr).await.unwrap();
    producer.produce("zero").await.unwrap();
    producer.produce("one").await.unwrap();

    let consumer = Client::connect(&addr).await.unwrap();
    let mut stream = consumer.consume_stream(0).await.unwrap();
    assert_eq!(stream.next().await.unwrap(), (0, b"zero".to_vec()));
    assert_eq!(stream.next().await.unwrap(), (1, b"one".to_vec()));

    // The stream waits out offsets that are not written yet.
    let produce = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        producer.produce("two").await.unwrap();
    });
    let (offset, value) =
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(offset, 2);
    assert_eq!(value, b"two");
    produce.await.unwrap();

    agents[0].shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (agents, _dirs) = start_agents(1).await;
    agents[0].shutdown().await.unwrap();
    agents[0].shutdown().await.unwrap();
}
