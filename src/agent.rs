//! The agent wires the pieces of one node together: the shared
//! listener, the replicated log, the client RPC server, and the
//! membership adapter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::distributed::DistributedLog;
use crate::error::RaftError;
use crate::membership::MembershipAdapter;
use crate::server;
use crate::stream_layer::StreamLayer;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub node_name: String,
    pub bootstrap: bool,
    /// Segment bounds and consensus timing; identity fields are filled
    /// in from the agent's own.
    pub config: Config,
}

pub struct Agent {
    log: Arc<DistributedLog>,
    rpc_addr: String,
    server_task: JoinHandle<()>,
    shutdown: Mutex<bool>,
}

impl Agent {
    /// Binds the listener and brings the node up. With `bootstrap` set,
    /// waits for the single-server cluster to elect itself.
    pub async fn new(agent_config: AgentConfig) -> Result<Self, RaftError> {
        let stream_layer = StreamLayer::bind(&agent_config.bind_addr).await?;
        let rpc_addr = stream_layer.local_addr()?.to_string();

        let mut config = agent_config.config.clone();
        config.raft.local_id = agent_config.node_name.clone();
        config.raft.bind_addr = rpc_addr.clone();
        config.raft.bootstrap = agent_config.bootstrap;

        let log = Arc::new(DistributedLog::open(
            &agent_config.data_dir,
            config,
            stream_layer,
        )?);
        let conns = log
            .client_connections()
            .ok_or_else(|| RaftError::Rpc("client connections already taken".to_string()))?;
        let server_task = tokio::spawn(server::serve(Arc::clone(&log), conns));

        if agent_config.bootstrap {
            log.wait_for_leader(Duration::from_secs(3)).await?;
        }
        info!(node = %agent_config.node_name, addr = %rpc_addr, "agent started");

        Ok(Self {
            log,
            rpc_addr,
            server_task,
            shutdown: Mutex::new(false),
        })
    }

    pub fn log(&self) -> &Arc<DistributedLog> {
        &self.log
    }

    /// The address clients and peers reach this node at.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// The handler the discovery layer feeds membership events into.
    pub fn membership(&self) -> MembershipAdapter {
        MembershipAdapter::new(Arc::clone(&self.log))
    }

    /// Ordered, idempotent shutdown: stop serving clients, then close
    /// the replicated log.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        {
            let mut done = self.shutdown.lock();
            if *done {
                return Ok(());
            }
            *done = true;
        }
        self.server_task.abort();
        self.log.close().await
    }
}
