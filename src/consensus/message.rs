//! Consensus wire messages and log entries.
//!
//! RPC frames carry one `RaftMessage` encoded with bincode; the transport
//! adds a `u32` big-endian length prefix.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub type ServerId = String;

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Server {
    pub id: ServerId,
    pub addr: String,
}

/// The active membership. Quorum is a strict majority of the servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn addr_of(&self, id: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.addr.as_str())
    }

    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }
}

/// What a consensus log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum EntryKind {
    /// A replicated command applied to the state machine.
    Command,
    /// Appended by a fresh leader to commit prior terms' entries.
    Noop,
    /// A serialized `Configuration` adopted when the entry applies.
    Configuration,
}

impl EntryKind {
    pub fn as_u32(self) -> u32 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Noop => 1,
            EntryKind::Configuration => 2,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => EntryKind::Noop,
            2 => EntryKind::Configuration,
            _ => EntryKind::Command,
        }
    }
}

/// One consensus log entry. Entry indexes start at 1 and are distinct
/// from the record offsets the state machine assigns.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: ServerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: ServerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On rejection, where the leader should back its next attempt to.
    pub conflict_index: u64,
    /// On success, the highest entry the follower now holds from us.
    pub matched_index: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader_id: ServerId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub configuration: Configuration,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub enum RaftMessage {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
}
