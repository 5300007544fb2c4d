//! The record type shared by store payloads and consensus commands.
//!
//! Records use the protocol-buffer wire format so the on-disk bytes stay
//! stable across hosts and releases.

/// A single log record. `offset` is assigned by the owning log at append
/// time; `term` and `kind` are populated only when the record carries a
/// consensus entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(uint32, tag = "4")]
    pub kind: u32,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Record {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Request-type discriminator prefixed to every replicated command
/// payload. Only append is defined today; further types are reserved.
pub const APPEND_REQUEST: u8 = 0;
