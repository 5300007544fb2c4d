use thiserror::Error;

/// Errors raised by the storage engine: store, index, segment and log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The only "expected" read error: the offset is not currently held
    /// by any segment. Stream consumers retry on it after a delay.
    #[error("offset {0} is out of range")]
    OffsetOutOfRange(u64),

    /// Reading or writing past the index capacity. Used internally to
    /// probe an empty index and to trigger segment rotation; it never
    /// escapes the log's public surface.
    #[error("end of index")]
    EndOfIndex,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("entry index {expected} does not match assigned offset {assigned}")]
    IndexMismatch { expected: u64, assigned: u64 },

    #[error("unknown request type {0}")]
    UnknownRequest(u8),

    #[error("snapshot is corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("log is closed")]
    Closed,
}

impl From<LogError> for std::io::Error {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Errors surfaced by the replicated log and the consensus core.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the cluster leader (known leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    /// The commit wait elapsed. The entry may still commit later;
    /// callers must treat the outcome as unknown.
    #[error("commit wait timed out")]
    CommitTimeout,

    #[error("timed out waiting for a leader")]
    NoLeader,

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("node is shut down")]
    Shutdown,

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Transport-level RPC errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc timed out")]
    Timeout,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
