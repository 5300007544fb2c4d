//! The leader-based consensus core: messages, capability traits, the
//! node driver, and its stable/snapshot stores and transport.

pub mod message;
pub mod node;
pub mod snapshot;
pub mod stable;
pub mod traits;
pub mod transport;

pub use message::{Configuration, Entry, EntryKind, Server, ServerId};
pub use node::{RaftHandle, RaftNode, RaftStatus, Role};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::StableStore;
pub use traits::{EntryStore, Fsm, FsmSnapshot};
pub use transport::Transport;
