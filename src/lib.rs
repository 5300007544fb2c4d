//! tidelog: a replicated, append-only commit log.
//!
//! Clients write opaque byte records and read them back by monotonically
//! assigned offsets. Storage is a segmented, memory-mapped-indexed
//! on-disk log; replication layers a leader-based consensus protocol on
//! top of it, and one TCP listener carries both consensus and client
//! traffic, split by a one-byte discriminator.

pub mod agent;
pub mod client;
pub mod config;
pub mod consensus;
pub mod distributed;
pub mod error;
pub mod fsm;
pub mod log_store;
pub mod membership;
pub mod record;
pub mod server;
pub mod storage;
pub mod stream_layer;

pub use agent::{Agent, AgentConfig};
pub use client::{Client, ClientError, RecordStream};
pub use config::{Config, RaftConfig, SegmentConfig};
pub use consensus::{Configuration, RaftStatus, Role, Server, ServerId};
pub use distributed::{DistributedLog, ServerInfo};
pub use error::{LogError, RaftError, RpcError};
pub use fsm::LogFsm;
pub use log_store::LogEntryStore;
pub use membership::{MemberEvent, MembershipAdapter, MembershipHandler};
pub use record::Record;
pub use storage::{Log, LogReader};
pub use stream_layer::{Connection, StreamLayer, RAFT_RPC};
