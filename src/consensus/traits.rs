//! Capability contracts the consensus node consumes. The concrete
//! state machine and entry store are injected, which keeps the protocol
//! core independent of the storage engine.

use std::io;

use crate::consensus::message::Entry;
use crate::error::LogError;

/// The replicated state machine. Called serially by the node driver.
pub trait Fsm: Send + Sync {
    /// Applies a committed entry and returns the offset it produced.
    fn apply(&self, entry: &Entry) -> Result<u64, LogError>;

    /// Opens a point-in-time snapshot over the machine's current state.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, LogError>;

    /// Rebuilds the machine's state from a snapshot byte stream. The
    /// node guarantees no concurrent applies while this runs.
    fn restore(&self, source: Box<dyn io::Read + Send>) -> Result<(), LogError>;
}

/// A snapshot handle produced by [`Fsm::snapshot`]. Stream the state into
/// a sink, then release.
pub trait FsmSnapshot: Send {
    fn persist(&mut self, sink: &mut dyn io::Write) -> Result<(), LogError>;

    fn release(&mut self) {}
}

/// Storage for consensus entries, indexed 1..=last. An empty store has
/// `first_index() > last_index()`.
pub trait EntryStore: Send + Sync {
    fn first_index(&self) -> u64;

    fn last_index(&self) -> u64;

    fn entry(&self, index: u64) -> Result<Entry, LogError>;

    fn term_of(&self, index: u64) -> Result<u64, LogError>;

    /// Appends entries; their indexes must extend the store contiguously.
    fn append(&self, entries: &[Entry]) -> Result<(), LogError>;

    /// Drops entries up to and including `upto` (prefix compaction).
    fn truncate_prefix(&self, upto: u64) -> Result<(), LogError>;

    /// Drops entries at and above `from` (conflict resolution).
    fn truncate_suffix(&self, from: u64) -> Result<(), LogError>;

    /// Discards everything; the next appended entry must carry
    /// `next_index`.
    fn reset(&self, next_index: u64) -> Result<(), LogError>;

    fn close(&self) -> Result<(), LogError>;
}
