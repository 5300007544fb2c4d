//! The replicated log: the single-node log wrapped in consensus.
//!
//! Writes are proposed to the consensus node and resolve with the offset
//! the state machine assigned on apply. Reads are served locally from
//! the applied log, so followers can lag; that is a deliberate trade.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::consensus::node::{RaftHandle, RaftNode};
use crate::consensus::snapshot::SnapshotStore;
use crate::consensus::stable::StableStore;
use crate::consensus::transport::{serve_peer, Transport};
use crate::error::{LogError, RaftError};
use crate::fsm::LogFsm;
use crate::log_store::LogEntryStore;
use crate::record::{Record, APPEND_REQUEST};
use crate::storage::log::Log;
use crate::stream_layer::{Connection, StreamLayer};

/// How many accepted client connections may wait for the server before
/// new ones are dropped.
const CLIENT_BACKLOG: usize = 64;

/// One cluster member as reported by [`DistributedLog::get_servers`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ServerInfo {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

pub struct DistributedLog {
    log: Arc<Log>,
    raft: RaftHandle,
    commit_timeout: Duration,
    local_id: String,
    accept_task: JoinHandle<()>,
    client_conns: Mutex<Option<mpsc::Receiver<TcpStream>>>,
}

impl DistributedLog {
    /// Opens the replicated log at `data_dir` and takes ownership of the
    /// stream layer's accept loop. Must run inside a tokio runtime.
    ///
    /// Layout under `data_dir`: the applied log lives in `log/`, the
    /// consensus entry log, stable store and snapshots in `consensus/`.
    pub fn open(
        data_dir: impl AsRef<Path>,
        mut config: Config,
        stream_layer: StreamLayer,
    ) -> Result<Self, RaftError> {
        let data_dir = data_dir.as_ref();
        if config.raft.bind_addr.is_empty() {
            config.raft.bind_addr = stream_layer.local_addr()?.to_string();
        }

        let log = Arc::new(Log::open(data_dir.join("log"), config.segment.clone())?);
        let fsm = Box::new(LogFsm::new(Arc::clone(&log)));
        let entries = Box::new(LogEntryStore::open(
            data_dir.join("consensus").join("log"),
            &config.segment,
        )?);
        let stable = StableStore::open(data_dir.join("consensus").join("stable"))?;
        let snapshots = SnapshotStore::open(data_dir.join("consensus").join("snapshots"), 1)?;

        let raft = RaftNode::spawn(
            config.raft.clone(),
            fsm,
            entries,
            stable,
            snapshots,
            Transport::new(),
        )?;

        let (client_tx, client_rx) = mpsc::channel(CLIENT_BACKLOG);
        let events = raft.event_sender();
        let accept_task = tokio::spawn(async move {
            loop {
                let stream = match stream_layer.accept_stream().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("listener closed: {}", e);
                        return;
                    }
                };
                // Classify off the accept path so an idle connection
                // cannot stall the listener.
                let events = events.clone();
                let client_tx = client_tx.clone();
                tokio::spawn(async move {
                    match StreamLayer::classify(stream).await {
                        Ok(Connection::Peer(stream)) => serve_peer(stream, events).await,
                        Ok(Connection::Client(stream)) => {
                            // Dropped when nobody serves clients or the
                            // backlog is full.
                            let _ = client_tx.try_send(stream);
                        }
                        Err(e) => debug!("failed to classify connection: {}", e),
                    }
                });
            }
        });

        Ok(Self {
            log,
            raft,
            commit_timeout: config.raft.commit_timeout,
            local_id: config.raft.local_id,
            accept_task,
            client_conns: Mutex::new(Some(client_rx)),
        })
    }

    /// Appends a record through consensus. Only the leader succeeds;
    /// the returned offset is the one the state machine assigned when
    /// the command applied. A timeout means the outcome is unknown.
    pub async fn append(&self, record: Record) -> Result<u64, RaftError> {
        let mut data = Vec::with_capacity(1 + record.encoded_len());
        data.push(APPEND_REQUEST);
        data.extend_from_slice(&record.encode_to_vec());
        self.raft.propose(data, self.commit_timeout).await
    }

    /// Reads from the locally applied log. Not linearized through
    /// consensus: a follower may serve stale data.
    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        self.log.read(offset)
    }

    /// Blocks until the cluster reports a leader or `timeout` elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, RaftError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.raft.status().await?;
            if let Some(leader) = status.leader {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RaftError::NoLeader);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Adds `id` as a voting member reachable at `addr`. Leader-only;
    /// a no-op when the member is already present with that address.
    pub async fn join(&self, id: &str, addr: &str) -> Result<(), RaftError> {
        self.raft.add_voter(id, addr).await
    }

    /// Removes `id` from the cluster. Leader-only.
    pub async fn leave(&self, id: &str) -> Result<(), RaftError> {
        self.raft.remove_server(id).await
    }

    pub async fn get_servers(&self) -> Result<Vec<ServerInfo>, RaftError> {
        let status = self.raft.status().await?;
        Ok(status
            .servers
            .iter()
            .map(|s| ServerInfo {
                id: s.id.clone(),
                rpc_addr: s.addr.clone(),
                is_leader: status.leader.as_deref() == Some(s.id.as_str()),
            })
            .collect())
    }

    /// Persists a state-machine snapshot and compacts the consensus
    /// entries it covers. There is no background cadence; callers decide
    /// when compaction is worth it.
    pub async fn snapshot(&self) -> Result<(), RaftError> {
        self.raft.take_snapshot().await
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Hands out the stream of multiplexed client connections, once.
    /// The RPC server consumes it; without a consumer client
    /// connections are dropped on accept.
    pub fn client_connections(&self) -> Option<mpsc::Receiver<TcpStream>> {
        self.client_conns.lock().take()
    }

    /// Shuts down consensus, stops the accept loop, and closes the
    /// applied log.
    pub async fn close(&self) -> Result<(), RaftError> {
        self.raft.shutdown().await;
        self.accept_task.abort();
        self.log.close()?;
        Ok(())
    }
}
