//! The replicated state machine: committed commands land in the log.

use std::io::{self, Read, Write};
use std::sync::Arc;

use prost::Message;

use crate::consensus::message::Entry;
use crate::consensus::traits::{Fsm, FsmSnapshot};
use crate::error::LogError;
use crate::record::{Record, APPEND_REQUEST};
use crate::storage::log::{Log, LogReader};
use crate::storage::store::LEN_WIDTH;

/// Applies append commands to the wrapped log. The log is shared with
/// the distributed log, which serves reads from it directly.
pub struct LogFsm {
    log: Arc<Log>,
}

impl LogFsm {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }
}

impl Fsm for LogFsm {
    fn apply(&self, entry: &Entry) -> Result<u64, LogError> {
        let Some((&request_type, payload)) = entry.data.split_first() else {
            return Err(LogError::UnknownRequest(0));
        };
        match request_type {
            APPEND_REQUEST => {
                let mut record = Record::decode(payload)?;
                self.log.append(&mut record)
            }
            other => Err(LogError::UnknownRequest(other)),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, LogError> {
        Ok(Box::new(LogSnapshot {
            reader: self.log.reader(),
        }))
    }

    /// Rebuilds the log from a snapshot byte stream: the first record's
    /// offset becomes the new initial offset, every record is appended.
    /// An empty stream leaves an empty log starting at zero.
    fn restore(&self, mut source: Box<dyn Read + Send>) -> Result<(), LogError> {
        let mut restored_any = false;
        while let Some(len) = read_length_prefix(source.as_mut())? {
            let mut buf = vec![0u8; len as usize];
            source
                .read_exact(&mut buf)
                .map_err(|_| LogError::SnapshotCorrupt("truncated record body".to_string()))?;
            let mut record = Record::decode(buf.as_slice())
                .map_err(|e| LogError::SnapshotCorrupt(format!("malformed record: {e}")))?;
            if !restored_any {
                self.log.reset_to(record.offset)?;
                restored_any = true;
            }
            self.log.append(&mut record)?;
        }
        if !restored_any {
            self.log.reset_to(0)?;
        }
        Ok(())
    }
}

/// Point-in-time snapshot over the log's bytes. The stream uses the
/// store framing, `[u64 BE length][record]`, so restore can consume the
/// log's reader output directly.
struct LogSnapshot {
    reader: LogReader,
}

impl FsmSnapshot for LogSnapshot {
    fn persist(&mut self, sink: &mut dyn Write) -> Result<(), LogError> {
        io::copy(&mut self.reader, sink)?;
        Ok(())
    }
}

/// Reads one length prefix; `None` on a clean end of stream, an error on
/// a partial one.
fn read_length_prefix(source: &mut dyn Read) -> Result<Option<u64>, LogError> {
    let mut len_buf = [0u8; LEN_WIDTH as usize];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = source.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(LogError::SnapshotCorrupt(
                "truncated length prefix".to_string(),
            ));
        }
        filled += n;
    }
    Ok(Some(u64::from_be_bytes(len_buf)))
}
