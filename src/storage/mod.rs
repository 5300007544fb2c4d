//! The single-node storage engine: store, index, segment, log.

pub mod index;
pub mod log;
pub mod segment;
pub mod store;

pub use log::{Log, LogReader};
pub use segment::Segment;
pub use store::Store;
