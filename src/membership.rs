//! Bridges an external discovery layer's membership events into cluster
//! configuration changes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::distributed::DistributedLog;
use crate::error::RaftError;

/// A membership event as produced by the discovery layer.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    Joined { id: String, rpc_addr: String },
    Left { id: String },
}

/// What the discovery layer calls into when cluster membership changes.
#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn member_joined(&self, id: &str, rpc_addr: &str);

    async fn member_left(&self, id: &str);
}

/// Translates member events into `join`/`leave` calls. Events about the
/// local node are ignored, and the underlying calls are idempotent, so
/// replayed events are harmless.
pub struct MembershipAdapter {
    log: Arc<DistributedLog>,
}

impl MembershipAdapter {
    pub fn new(log: Arc<DistributedLog>) -> Self {
        Self { log }
    }

    pub async fn handle_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::Joined { id, rpc_addr } => self.member_joined(&id, &rpc_addr).await,
            MemberEvent::Left { id } => self.member_left(&id).await,
        }
    }
}

#[async_trait]
impl MembershipHandler for MembershipAdapter {
    async fn member_joined(&self, id: &str, rpc_addr: &str) {
        if id == self.log.local_id() {
            return;
        }
        if let Err(e) = self.log.join(id, rpc_addr).await {
            log_membership_error("join", id, e);
        }
    }

    async fn member_left(&self, id: &str) {
        if id == self.log.local_id() {
            return;
        }
        if let Err(e) = self.log.leave(id).await {
            log_membership_error("leave", id, e);
        }
    }
}

/// Non-leaders see every event too; their rejections are routine. Only
/// genuinely unexpected failures deserve an error log, and either way
/// the event is dropped: the next event retries.
fn log_membership_error(op: &str, id: &str, err: RaftError) {
    match err {
        RaftError::NotLeader { .. } | RaftError::CommitTimeout => {
            debug!("{} of {} deferred: {}", op, id, err);
        }
        err => error!("{} of {} failed: {}", op, id, err),
    }
}
