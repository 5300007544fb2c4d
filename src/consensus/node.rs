//! The consensus node driver.
//!
//! One spawned task owns all protocol state and consumes a single event
//! channel: inbound RPCs, client proposals, membership changes, and the
//! results of replication tasks all arrive as events, so no state is
//! shared behind locks. Timers are folded into the same loop via
//! `select!` on the next role deadline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::consensus::message::{
    AppendEntries, AppendEntriesResponse, Configuration, Entry, EntryKind, InstallSnapshot,
    InstallSnapshotResponse, RaftMessage, RequestVote, RequestVoteResponse, Server, ServerId,
};
use crate::consensus::snapshot::{SnapshotMeta, SnapshotStore};
use crate::consensus::stable::StableStore;
use crate::consensus::traits::{EntryStore, Fsm};
use crate::consensus::transport::Transport;
use crate::error::{LogError, RaftError};

const KEY_CURRENT_TERM: &str = "current_term";
const KEY_VOTED_FOR: &str = "voted_for";
const KEY_CONFIGURATION: &str = "configuration";

const MAX_BATCH_ENTRIES: u64 = 64;
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: ServerId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<ServerId>,
    pub servers: Vec<Server>,
    pub commit_index: u64,
    pub last_applied: u64,
}

pub enum RaftEvent {
    Rpc {
        msg: RaftMessage,
        reply: oneshot::Sender<RaftMessage>,
    },
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    AddVoter {
        id: ServerId,
        addr: String,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    RemoveServer {
        id: ServerId,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    VoteResult {
        peer: ServerId,
        election_term: u64,
        resp: RequestVoteResponse,
    },
    AppendResult {
        peer: ServerId,
        resp: AppendEntriesResponse,
    },
    SnapshotSent {
        peer: ServerId,
        snapshot_index: u64,
        resp: InstallSnapshotResponse,
    },
    PeerUnreachable {
        peer: ServerId,
    },
}

/// Cheap, clonable handle to a running node driver.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftEvent>,
}

impl RaftHandle {
    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<RaftEvent> {
        self.tx.clone()
    }

    pub async fn propose(&self, data: Vec<u8>, commit_timeout: Duration) -> Result<u64, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftEvent::Propose { data, reply })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::CommitTimeout),
        }
    }

    pub async fn add_voter(&self, id: &str, addr: &str) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftEvent::AddVoter {
                id: id.to_string(),
                addr: addr.to_string(),
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(MEMBERSHIP_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::CommitTimeout),
        }
    }

    pub async fn remove_server(&self, id: &str) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftEvent::RemoveServer {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(MEMBERSHIP_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::CommitTimeout),
        }
    }

    pub async fn take_snapshot(&self) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftEvent::TakeSnapshot { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftEvent::Status { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RaftEvent::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct RaftNode {
    config: RaftConfig,
    fsm: Box<dyn Fsm>,
    entries: Box<dyn EntryStore>,
    stable: StableStore,
    snapshots: SnapshotStore,
    transport: Transport,

    rx: mpsc::UnboundedReceiver<RaftEvent>,
    tx: mpsc::UnboundedSender<RaftEvent>,

    role: Role,
    term: u64,
    voted_for: Option<ServerId>,
    leader: Option<ServerId>,
    configuration: Configuration,
    commit_index: u64,
    last_applied: u64,
    snapshot_index: u64,
    snapshot_term: u64,

    next_index: HashMap<ServerId, u64>,
    match_index: HashMap<ServerId, u64>,
    inflight: HashSet<ServerId>,
    last_contact: HashMap<ServerId, Instant>,
    last_leader_contact: Instant,
    votes: HashSet<ServerId>,

    pending: BTreeMap<u64, oneshot::Sender<Result<u64, RaftError>>>,
    pending_config: Option<(u64, oneshot::Sender<Result<(), RaftError>>)>,

    election_deadline: Instant,
    heartbeat_at: Instant,
}

impl RaftNode {
    /// Builds the node from its injected parts, recovers persisted state
    /// (hard state, snapshot, entries), and spawns the driver task.
    /// Must run inside a tokio runtime.
    pub fn spawn(
        config: RaftConfig,
        fsm: Box<dyn Fsm>,
        entries: Box<dyn EntryStore>,
        stable: StableStore,
        snapshots: SnapshotStore,
        transport: Transport,
    ) -> Result<RaftHandle, RaftError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let term = stable.get_u64(KEY_CURRENT_TERM).unwrap_or(0);
        let voted_for = match stable.get(KEY_VOTED_FOR) {
            Some(bytes) => decode_stable(&bytes)?,
            None => None,
        };
        let configuration = match stable.get(KEY_CONFIGURATION) {
            Some(bytes) => decode_stable(&bytes)?,
            None => Configuration::default(),
        };

        let mut node = RaftNode {
            config,
            fsm,
            entries,
            stable,
            snapshots,
            transport,
            rx,
            tx: tx.clone(),
            role: Role::Follower,
            term,
            voted_for,
            leader: None,
            configuration,
            commit_index: 0,
            last_applied: 0,
            snapshot_index: 0,
            snapshot_term: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight: HashSet::new(),
            last_contact: HashMap::new(),
            last_leader_contact: Instant::now(),
            votes: HashSet::new(),
            pending: BTreeMap::new(),
            pending_config: None,
            election_deadline: Instant::now(),
            heartbeat_at: Instant::now(),
        };

        node.restore_fsm()?;
        node.maybe_bootstrap()?;
        node.reset_election_deadline();

        tokio::spawn(node.run());
        Ok(RaftHandle { tx })
    }

    /// The state machine is rebuilt on every start: restore the latest
    /// snapshot if one exists, otherwise start it empty. Entries past
    /// the snapshot are re-applied as the commit index advances.
    fn restore_fsm(&mut self) -> Result<(), RaftError> {
        match self.snapshots.latest()? {
            Some((meta, file)) => {
                info!(
                    index = meta.index,
                    term = meta.term,
                    "restoring state machine from snapshot"
                );
                self.fsm.restore(Box::new(file))?;
                self.snapshot_index = meta.index;
                self.snapshot_term = meta.term;
                self.commit_index = meta.index;
                self.last_applied = meta.index;
                if self.configuration.servers.is_empty() {
                    self.configuration = meta.configuration;
                }
            }
            None => {
                self.fsm.restore(Box::new(io::empty()))?;
            }
        }
        Ok(())
    }

    fn maybe_bootstrap(&mut self) -> Result<(), RaftError> {
        if !self.config.bootstrap {
            return Ok(());
        }
        let fresh = self.term == 0
            && self.entries.last_index() == 0
            && self.snapshot_index == 0
            && self.configuration.servers.is_empty();
        if !fresh {
            return Ok(());
        }
        info!(id = %self.config.local_id, "bootstrapping single-server cluster");
        self.configuration = Configuration {
            servers: vec![Server {
                id: self.config.local_id.clone(),
                addr: self.config.bind_addr.clone(),
            }],
        };
        self.persist_configuration()?;
        Ok(())
    }

    async fn run(mut self) {
        loop {
            let deadline = match self.role {
                Role::Leader => self.heartbeat_at,
                _ => self.election_deadline,
            };
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(RaftEvent::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    Some(event) => self.handle_event(event),
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.tick(),
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        if let Some((_, reply)) = self.pending_config.take() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        if let Err(e) = self.entries.close() {
            warn!("failed to close entry store: {}", e);
        }
        info!(id = %self.config.local_id, "consensus node stopped");
    }

    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Rpc { msg, reply } => {
                let resp = self.handle_rpc(msg);
                let _ = reply.send(resp);
            }
            RaftEvent::Propose { data, reply } => self.handle_propose(data, reply),
            RaftEvent::AddVoter { id, addr, reply } => self.handle_add_voter(id, addr, reply),
            RaftEvent::RemoveServer { id, reply } => self.handle_remove_server(id, reply),
            RaftEvent::TakeSnapshot { reply } => {
                let result = self.take_snapshot();
                let _ = reply.send(result);
            }
            RaftEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RaftEvent::Shutdown { .. } => {}
            RaftEvent::VoteResult {
                peer,
                election_term,
                resp,
            } => self.handle_vote_result(peer, election_term, resp),
            RaftEvent::AppendResult { peer, resp } => self.handle_append_result(peer, resp),
            RaftEvent::SnapshotSent {
                peer,
                snapshot_index,
                resp,
            } => self.handle_snapshot_sent(peer, snapshot_index, resp),
            RaftEvent::PeerUnreachable { peer } => {
                self.inflight.remove(&peer);
            }
        }
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.config.local_id.clone(),
            role: self.role,
            term: self.term,
            leader: self.leader.clone(),
            servers: self.configuration.servers.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }

    // === timers ===

    fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                if !self.leader_lease_held() {
                    warn!(id = %self.config.local_id, "lost quorum contact, stepping down");
                    self.become_follower(self.term);
                    return;
                }
                self.broadcast();
                self.heartbeat_at = Instant::now() + self.heartbeat_interval();
            }
            Role::Follower | Role::Candidate => {
                if self.configuration.contains(&self.config.local_id) {
                    self.start_election();
                } else {
                    // Not a voter (yet, or anymore); wait for a leader to
                    // contact us instead of campaigning.
                    self.reset_election_deadline();
                }
            }
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.config.heartbeat_timeout / 10).max(Duration::from_millis(10))
    }

    fn election_jitter(&self) -> Duration {
        let base = self.config.election_timeout;
        let span = base.as_millis().max(1) as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..span))
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.election_jitter();
    }

    fn leader_lease_held(&self) -> bool {
        let quorum = self.configuration.quorum();
        let lease = self.config.leader_lease_timeout;
        let mut fresh = 0usize;
        for server in &self.configuration.servers {
            if server.id == self.config.local_id {
                fresh += 1;
            } else if let Some(at) = self.last_contact.get(&server.id) {
                if at.elapsed() < lease {
                    fresh += 1;
                }
            }
        }
        fresh >= quorum
    }

    // === elections ===

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.term += 1;
        self.voted_for = Some(self.config.local_id.clone());
        self.leader = None;
        if let Err(e) = self.persist_hard_state() {
            error!("failed to persist hard state, aborting election: {}", e);
            self.role = Role::Follower;
            return;
        }
        self.votes.clear();
        self.votes.insert(self.config.local_id.clone());
        self.reset_election_deadline();

        debug!(id = %self.config.local_id, term = self.term, "starting election");

        let (last_log_index, last_log_term) = self.last_entry_info();
        let req = RequestVote {
            term: self.term,
            candidate_id: self.config.local_id.clone(),
            last_log_index,
            last_log_term,
        };
        let election_term = self.term;
        for server in self.configuration.servers.clone() {
            if server.id == self.config.local_id {
                continue;
            }
            let transport = self.transport.clone();
            let events = self.tx.clone();
            let msg = RaftMessage::RequestVote(req.clone());
            tokio::spawn(async move {
                match transport.request(&server.addr, &msg).await {
                    Ok(RaftMessage::RequestVoteResponse(resp)) => {
                        let _ = events.send(RaftEvent::VoteResult {
                            peer: server.id,
                            election_term,
                            resp,
                        });
                    }
                    Ok(_) => warn!("unexpected response to vote request from {}", server.id),
                    Err(e) => debug!("vote request to {} failed: {}", server.id, e),
                }
            });
        }
        if self.votes.len() >= self.configuration.quorum() {
            self.become_leader();
        }
    }

    fn handle_vote_result(
        &mut self,
        peer: ServerId,
        election_term: u64,
        resp: RequestVoteResponse,
    ) {
        if resp.term > self.term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Candidate || election_term != self.term || !resp.vote_granted {
            return;
        }
        self.votes.insert(peer);
        if self.votes.len() >= self.configuration.quorum() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(id = %self.config.local_id, term = self.term, "became leader");
        self.role = Role::Leader;
        self.leader = Some(self.config.local_id.clone());
        let last = self.entries.last_index();
        self.next_index.clear();
        self.match_index.clear();
        self.inflight.clear();
        self.last_contact.clear();
        let now = Instant::now();
        for server in &self.configuration.servers {
            if server.id == self.config.local_id {
                continue;
            }
            self.next_index.insert(server.id.clone(), last + 1);
            self.match_index.insert(server.id.clone(), 0);
            self.last_contact.insert(server.id.clone(), now);
        }
        // A no-op from the new term lets prior terms' entries commit.
        let noop = Entry {
            index: last + 1,
            term: self.term,
            kind: EntryKind::Noop,
            data: Vec::new(),
        };
        if let Err(e) = self.entries.append(&[noop]) {
            error!("failed to append no-op entry: {}", e);
            self.become_follower(self.term);
            return;
        }
        self.advance_commit();
        self.broadcast();
        self.heartbeat_at = Instant::now() + self.heartbeat_interval();
    }

    fn become_follower(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            if let Err(e) = self.persist_hard_state() {
                error!("failed to persist hard state: {}", e);
            }
        }
        if self.role == Role::Leader {
            let leader = self.leader.clone().filter(|l| *l != self.config.local_id);
            for (_, reply) in std::mem::take(&mut self.pending) {
                let _ = reply.send(Err(RaftError::NotLeader {
                    leader: leader.clone(),
                }));
            }
            if let Some((_, reply)) = self.pending_config.take() {
                let _ = reply.send(Err(RaftError::Membership(
                    "leadership lost before the change committed".to_string(),
                )));
            }
        }
        self.role = Role::Follower;
        self.votes.clear();
        if self.leader.as_deref() == Some(self.config.local_id.as_str()) {
            self.leader = None;
        }
        self.reset_election_deadline();
    }

    // === replication (leader side) ===

    fn broadcast(&mut self) {
        for server in self.configuration.servers.clone() {
            if server.id != self.config.local_id {
                self.replicate_to(&server.id, &server.addr);
            }
        }
    }

    fn replicate_to(&mut self, peer: &str, addr: &str) {
        if self.inflight.contains(peer) {
            return;
        }
        let last = self.entries.last_index();
        let next = *self.next_index.get(peer).unwrap_or(&(last + 1));
        let prev = next.saturating_sub(1);

        let needs_snapshot =
            prev > 0 && prev != self.snapshot_index && prev < self.entries.first_index();
        if needs_snapshot {
            self.send_snapshot(peer, addr);
            return;
        }

        let prev_log_term = match self.term_at(prev) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot resolve term for index {}: {}", prev, e);
                return;
            }
        };
        let high = last.min(next + MAX_BATCH_ENTRIES - 1);
        let mut batch = Vec::new();
        for index in next..=high {
            match self.entries.entry(index) {
                Ok(entry) => batch.push(entry),
                Err(e) => {
                    warn!("cannot load entry {} for replication: {}", index, e);
                    return;
                }
            }
        }

        let msg = RaftMessage::AppendEntries(AppendEntries {
            term: self.term,
            leader_id: self.config.local_id.clone(),
            prev_log_index: prev,
            prev_log_term,
            entries: batch,
            leader_commit: self.commit_index,
        });

        self.inflight.insert(peer.to_string());
        let transport = self.transport.clone();
        let events = self.tx.clone();
        let peer = peer.to_string();
        let addr = addr.to_string();
        tokio::spawn(async move {
            match transport.request(&addr, &msg).await {
                Ok(RaftMessage::AppendEntriesResponse(resp)) => {
                    let _ = events.send(RaftEvent::AppendResult { peer, resp });
                }
                Ok(_) => {
                    warn!("unexpected response to append entries from {}", peer);
                    let _ = events.send(RaftEvent::PeerUnreachable { peer });
                }
                Err(e) => {
                    debug!("append entries to {} failed: {}", peer, e);
                    let _ = events.send(RaftEvent::PeerUnreachable { peer });
                }
            }
        });
    }

    fn send_snapshot(&mut self, peer: &str, addr: &str) {
        let (meta, mut file) = match self.snapshots.latest() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(
                    "peer {} needs entries below {} but no snapshot exists",
                    peer,
                    self.entries.first_index()
                );
                return;
            }
            Err(e) => {
                warn!("failed to open latest snapshot: {}", e);
                return;
            }
        };
        let mut data = Vec::new();
        if let Err(e) = file.read_to_end(&mut data) {
            warn!("failed to read snapshot data: {}", e);
            return;
        }

        let snapshot_index = meta.index;
        let msg = RaftMessage::InstallSnapshot(InstallSnapshot {
            term: self.term,
            leader_id: self.config.local_id.clone(),
            last_included_index: meta.index,
            last_included_term: meta.term,
            configuration: meta.configuration,
            data,
        });

        self.inflight.insert(peer.to_string());
        let transport = self.transport.clone();
        let events = self.tx.clone();
        let peer = peer.to_string();
        let addr = addr.to_string();
        tokio::spawn(async move {
            match transport.request(&addr, &msg).await {
                Ok(RaftMessage::InstallSnapshotResponse(resp)) => {
                    let _ = events.send(RaftEvent::SnapshotSent {
                        peer,
                        snapshot_index,
                        resp,
                    });
                }
                Ok(_) => {
                    warn!("unexpected response to install snapshot from {}", peer);
                    let _ = events.send(RaftEvent::PeerUnreachable { peer });
                }
                Err(e) => {
                    debug!("install snapshot to {} failed: {}", peer, e);
                    let _ = events.send(RaftEvent::PeerUnreachable { peer });
                }
            }
        });
    }

    fn handle_append_result(&mut self, peer: ServerId, resp: AppendEntriesResponse) {
        self.inflight.remove(&peer);
        if resp.term > self.term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        self.last_contact.insert(peer.clone(), Instant::now());

        let addr = match self.configuration.addr_of(&peer) {
            Some(addr) => addr.to_string(),
            None => return, // removed while the rpc was in flight
        };
        if resp.success {
            self.match_index.insert(peer.clone(), resp.matched_index);
            self.next_index.insert(peer.clone(), resp.matched_index + 1);
            self.advance_commit();
            if resp.matched_index < self.entries.last_index() {
                self.replicate_to(&peer, &addr);
            }
        } else {
            let back_off = resp.conflict_index.max(1);
            self.next_index.insert(peer.clone(), back_off);
            self.replicate_to(&peer, &addr);
        }
    }

    fn handle_snapshot_sent(
        &mut self,
        peer: ServerId,
        snapshot_index: u64,
        resp: InstallSnapshotResponse,
    ) {
        self.inflight.remove(&peer);
        if resp.term > self.term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Leader || !resp.success {
            return;
        }
        self.last_contact.insert(peer.clone(), Instant::now());
        self.match_index.insert(peer.clone(), snapshot_index);
        self.next_index.insert(peer.clone(), snapshot_index + 1);
        if let Some(addr) = self.configuration.addr_of(&peer).map(str::to_string) {
            self.replicate_to(&peer, &addr);
        }
    }

    /// Advances the commit index to the quorum median, restricted to
    /// entries from the current term, and applies what became committed.
    fn advance_commit(&mut self) {
        let last = self.entries.last_index();
        let mut matches: Vec<u64> = self
            .configuration
            .servers
            .iter()
            .map(|s| {
                if s.id == self.config.local_id {
                    last
                } else {
                    self.match_index.get(&s.id).copied().unwrap_or(0)
                }
            })
            .collect();
        let quorum = self.configuration.quorum();
        if matches.len() < quorum {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[quorum - 1];
        if candidate <= self.commit_index {
            return;
        }
        match self.term_at(candidate) {
            Ok(term) if term == self.term => {
                self.commit_index = candidate;
                self.apply_committed();
            }
            Ok(_) => {}
            Err(e) => warn!("cannot resolve term for commit candidate {}: {}", candidate, e),
        }
    }

    /// Applies every committed-but-unapplied entry, serially, resolving
    /// pending proposals with the state machine's result.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.entries.entry(index) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("cannot load committed entry {}: {}", index, e);
                    return;
                }
            };
            match entry.kind {
                EntryKind::Command => {
                    let result = self.fsm.apply(&entry).map_err(RaftError::from);
                    match self.pending.remove(&index) {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!("apply of entry {} failed: {}", index, e);
                            }
                        }
                    }
                }
                EntryKind::Noop => {}
                EntryKind::Configuration => self.apply_configuration(index, &entry),
            }
            self.last_applied = index;
        }
    }

    fn apply_configuration(&mut self, index: u64, entry: &Entry) {
        let configuration: Configuration =
            match bincode::decode_from_slice(&entry.data, bincode::config::standard()) {
                Ok((configuration, _)) => configuration,
                Err(e) => {
                    error!("undecodable configuration entry at {}: {}", index, e);
                    return;
                }
            };
        info!(
            index,
            servers = configuration.servers.len(),
            "configuration applied"
        );
        self.configuration = configuration;
        if let Err(e) = self.persist_configuration() {
            error!("failed to persist configuration: {}", e);
        }
        if let Some((pending_index, _)) = &self.pending_config {
            if *pending_index == index {
                if let Some((_, reply)) = self.pending_config.take() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        let member_ids: HashSet<ServerId> = self
            .configuration
            .servers
            .iter()
            .map(|s| s.id.clone())
            .collect();
        self.next_index.retain(|id, _| member_ids.contains(id));
        self.match_index.retain(|id, _| member_ids.contains(id));
        self.last_contact.retain(|id, _| member_ids.contains(id));

        if !self.configuration.contains(&self.config.local_id) && self.role != Role::Follower {
            info!(id = %self.config.local_id, "removed from the configuration, stepping down");
            self.become_follower(self.term);
        }
    }

    // === proposals and membership ===

    fn handle_propose(&mut self, data: Vec<u8>, reply: oneshot::Sender<Result<u64, RaftError>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let index = self.entries.last_index() + 1;
        let entry = Entry {
            index,
            term: self.term,
            kind: EntryKind::Command,
            data,
        };
        if let Err(e) = self.entries.append(&[entry]) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.pending.insert(index, reply);
        self.advance_commit();
        self.broadcast();
    }

    fn handle_add_voter(
        &mut self,
        id: ServerId,
        addr: String,
        reply: oneshot::Sender<Result<(), RaftError>>,
    ) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        if self
            .configuration
            .servers
            .iter()
            .any(|s| s.id == id && s.addr == addr)
        {
            let _ = reply.send(Ok(()));
            return;
        }
        // Replace any server already claiming the id or the address.
        let mut configuration = self.configuration.clone();
        configuration
            .servers
            .retain(|s| s.id != id && s.addr != addr);
        configuration.servers.push(Server { id, addr });
        self.propose_configuration(configuration, reply);
    }

    fn handle_remove_server(
        &mut self,
        id: ServerId,
        reply: oneshot::Sender<Result<(), RaftError>>,
    ) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        if !self.configuration.contains(&id) {
            let _ = reply.send(Ok(()));
            return;
        }
        let mut configuration = self.configuration.clone();
        configuration.servers.retain(|s| s.id != id);
        self.propose_configuration(configuration, reply);
    }

    fn propose_configuration(
        &mut self,
        configuration: Configuration,
        reply: oneshot::Sender<Result<(), RaftError>>,
    ) {
        if self.pending_config.is_some() {
            let _ = reply.send(Err(RaftError::Membership(
                "configuration change already in progress".to_string(),
            )));
            return;
        }
        let data = match bincode::encode_to_vec(&configuration, bincode::config::standard()) {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(RaftError::Rpc(e.to_string())));
                return;
            }
        };
        let index = self.entries.last_index() + 1;
        let entry = Entry {
            index,
            term: self.term,
            kind: EntryKind::Configuration,
            data,
        };
        if let Err(e) = self.entries.append(&[entry]) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        // The leader replicates with the new membership right away;
        // everyone adopts it for real when the entry applies.
        self.configuration = configuration;
        for server in &self.configuration.servers {
            if server.id == self.config.local_id {
                continue;
            }
            self.next_index.entry(server.id.clone()).or_insert(index);
            self.match_index.entry(server.id.clone()).or_insert(0);
            self.last_contact
                .entry(server.id.clone())
                .or_insert_with(Instant::now);
        }
        self.pending_config = Some((index, reply));
        self.advance_commit();
        self.broadcast();
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self
                .leader
                .clone()
                .filter(|l| *l != self.config.local_id),
        }
    }

    // === snapshots ===

    fn take_snapshot(&mut self) -> Result<(), RaftError> {
        if self.last_applied == 0 || self.last_applied == self.snapshot_index {
            return Ok(());
        }
        let index = self.last_applied;
        let term = self.term_at(index)?;
        info!(index, term, "taking snapshot");

        let mut snapshot = self.fsm.snapshot()?;
        let mut sink = self.snapshots.create(SnapshotMeta {
            index,
            term,
            configuration: self.configuration.clone(),
        })?;
        if let Err(e) = snapshot.persist(&mut sink) {
            snapshot.release();
            sink.cancel();
            return Err(e.into());
        }
        snapshot.release();
        sink.finalize()?;

        self.snapshot_index = index;
        self.snapshot_term = term;
        self.entries.truncate_prefix(index)?;
        Ok(())
    }

    // === inbound rpc ===

    fn handle_rpc(&mut self, msg: RaftMessage) -> RaftMessage {
        match msg {
            RaftMessage::RequestVote(req) => {
                RaftMessage::RequestVoteResponse(self.handle_request_vote(req))
            }
            RaftMessage::AppendEntries(req) => {
                RaftMessage::AppendEntriesResponse(self.handle_append_entries(req))
            }
            RaftMessage::InstallSnapshot(req) => {
                RaftMessage::InstallSnapshotResponse(self.handle_install_snapshot(req))
            }
            other => {
                warn!("ignoring unexpected rpc request");
                other
            }
        }
    }

    fn handle_request_vote(&mut self, req: RequestVote) -> RequestVoteResponse {
        // Leader stickiness: while a live leader is known (or we hold the
        // lease ourselves), campaigns are rejected without adopting the
        // candidate's term. This keeps servers that were removed from the
        // configuration from disrupting a healthy cluster.
        if req.term > self.term {
            let follower_sticky = self.role != Role::Leader
                && self.leader.is_some()
                && self.last_leader_contact.elapsed() < self.config.election_timeout;
            let leader_sticky = self.role == Role::Leader && self.leader_lease_held();
            if follower_sticky || leader_sticky {
                debug!(
                    candidate = %req.candidate_id,
                    "rejecting vote request, current leader still live"
                );
                return self.deny_vote();
            }
            self.become_follower(req.term);
        }
        if req.term < self.term {
            return self.deny_vote();
        }

        let (last_log_index, last_log_term) = self.last_entry_info();
        let log_ok = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
        let member_ok = self.configuration.servers.is_empty()
            || self.configuration.contains(&req.candidate_id);
        let can_vote = match &self.voted_for {
            None => true,
            Some(voted) => *voted == req.candidate_id,
        };
        if !(log_ok && member_ok && can_vote) {
            return self.deny_vote();
        }

        if self.voted_for.as_deref() != Some(req.candidate_id.as_str()) {
            self.voted_for = Some(req.candidate_id.clone());
            if let Err(e) = self.persist_hard_state() {
                error!("failed to persist vote: {}", e);
                return self.deny_vote();
            }
        }
        self.reset_election_deadline();
        RequestVoteResponse {
            term: self.term,
            vote_granted: true,
        }
    }

    fn deny_vote(&self) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.term,
            vote_granted: false,
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntries) -> AppendEntriesResponse {
        if req.term < self.term {
            return AppendEntriesResponse {
                term: self.term,
                success: false,
                conflict_index: self.entries.last_index() + 1,
                matched_index: 0,
            };
        }
        if req.term > self.term || self.role != Role::Follower {
            self.become_follower(req.term);
        }
        self.leader = Some(req.leader_id.clone());
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        match self.try_append(&req) {
            Ok(resp) => resp,
            Err(e) => {
                error!("append entries failed: {}", e);
                AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    conflict_index: self.entries.last_index() + 1,
                    matched_index: 0,
                }
            }
        }
    }

    fn try_append(&mut self, req: &AppendEntries) -> Result<AppendEntriesResponse, LogError> {
        let last = self.entries.last_index();
        if req.prev_log_index > last {
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                conflict_index: last + 1,
                matched_index: 0,
            });
        }
        if req.prev_log_index > 0
            && req.prev_log_index >= self.entries.first_index().max(self.snapshot_index)
        {
            let prev_term = self.term_at(req.prev_log_index)?;
            if prev_term != req.prev_log_term {
                return Ok(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    conflict_index: req.prev_log_index,
                    matched_index: 0,
                });
            }
        }

        // Skip entries we already hold; truncate on the first term
        // conflict; append the remainder.
        let mut start = req.entries.len();
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.index > self.entries.last_index() {
                start = i;
                break;
            }
            if entry.index < self.entries.first_index() || entry.index <= self.snapshot_index {
                continue;
            }
            if self.entries.term_of(entry.index)? != entry.term {
                self.entries.truncate_suffix(entry.index)?;
                start = i;
                break;
            }
        }
        if start < req.entries.len() {
            self.entries.append(&req.entries[start..])?;
        }

        let matched = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.entries.last_index());
            self.apply_committed();
        }
        Ok(AppendEntriesResponse {
            term: self.term,
            success: true,
            conflict_index: 0,
            matched_index: matched,
        })
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshot) -> InstallSnapshotResponse {
        if req.term < self.term {
            return InstallSnapshotResponse {
                term: self.term,
                success: false,
            };
        }
        if req.term > self.term || self.role != Role::Follower {
            self.become_follower(req.term);
        }
        self.leader = Some(req.leader_id.clone());
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        if req.last_included_index <= self.snapshot_index
            || req.last_included_index <= self.last_applied
        {
            // Already covered; nothing to install.
            return InstallSnapshotResponse {
                term: self.term,
                success: true,
            };
        }

        match self.install_snapshot(&req) {
            Ok(()) => InstallSnapshotResponse {
                term: self.term,
                success: true,
            },
            Err(e) => {
                error!("snapshot install failed: {}", e);
                InstallSnapshotResponse {
                    term: self.term,
                    success: false,
                }
            }
        }
    }

    fn install_snapshot(&mut self, req: &InstallSnapshot) -> Result<(), RaftError> {
        info!(
            index = req.last_included_index,
            term = req.last_included_term,
            "installing snapshot from leader"
        );
        self.fsm
            .restore(Box::new(io::Cursor::new(req.data.clone())))?;
        self.entries.reset(req.last_included_index + 1)?;
        self.snapshot_index = req.last_included_index;
        self.snapshot_term = req.last_included_term;
        self.commit_index = req.last_included_index;
        self.last_applied = req.last_included_index;
        self.configuration = req.configuration.clone();
        self.persist_configuration()?;
        // Keep a local copy so a restart can restore without the leader.
        self.snapshots.save(
            SnapshotMeta {
                index: req.last_included_index,
                term: req.last_included_term,
                configuration: req.configuration.clone(),
            },
            &req.data,
        )?;
        Ok(())
    }

    // === persistence helpers ===

    fn persist_hard_state(&self) -> Result<(), RaftError> {
        self.stable.set_u64(KEY_CURRENT_TERM, self.term)?;
        let voted = bincode::encode_to_vec(&self.voted_for, bincode::config::standard())
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        self.stable.set(KEY_VOTED_FOR, &voted)?;
        Ok(())
    }

    fn persist_configuration(&self) -> Result<(), RaftError> {
        let bytes = bincode::encode_to_vec(&self.configuration, bincode::config::standard())
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        self.stable.set(KEY_CONFIGURATION, &bytes)?;
        Ok(())
    }

    fn term_at(&self, index: u64) -> Result<u64, LogError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_index {
            return Ok(self.snapshot_term);
        }
        self.entries.term_of(index)
    }

    fn last_entry_info(&self) -> (u64, u64) {
        let last = self.entries.last_index();
        let term = self.term_at(last).unwrap_or(0);
        (last, term)
    }
}

fn decode_stable<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, RaftError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| RaftError::Rpc(format!("corrupt stable store value: {e}")))
}
