//! Adapter exposing a [`Log`] as the consensus node's entry store.
//!
//! The adapter keeps consensus entries in a dedicated log whose initial
//! offset is 1, so a record's offset equals its entry index by
//! construction: one append per entry, indexes assigned in order.

use std::path::Path;

use crate::config::SegmentConfig;
use crate::consensus::message::{Entry, EntryKind};
use crate::consensus::traits::EntryStore;
use crate::error::LogError;
use crate::record::Record;
use crate::storage::log::Log;

pub struct LogEntryStore {
    log: Log,
}

impl LogEntryStore {
    pub fn open(dir: impl AsRef<Path>, config: &SegmentConfig) -> Result<Self, LogError> {
        let mut config = config.clone();
        config.initial_offset = 1;
        Ok(Self {
            log: Log::open(dir, config)?,
        })
    }

    fn entry_from(record: Record) -> Entry {
        Entry {
            index: record.offset,
            term: record.term,
            kind: EntryKind::from_u32(record.kind),
            data: record.value,
        }
    }
}

impl EntryStore for LogEntryStore {
    fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    fn last_index(&self) -> u64 {
        self.log.highest_offset()
    }

    fn entry(&self, index: u64) -> Result<Entry, LogError> {
        Ok(Self::entry_from(self.log.read(index)?))
    }

    fn term_of(&self, index: u64) -> Result<u64, LogError> {
        Ok(self.log.read(index)?.term)
    }

    fn append(&self, entries: &[Entry]) -> Result<(), LogError> {
        for entry in entries {
            let mut record = Record {
                offset: 0,
                value: entry.data.clone(),
                term: entry.term,
                kind: entry.kind.as_u32(),
            };
            let assigned = self.log.append(&mut record)?;
            if assigned != entry.index {
                return Err(LogError::IndexMismatch {
                    expected: entry.index,
                    assigned,
                });
            }
        }
        Ok(())
    }

    fn truncate_prefix(&self, upto: u64) -> Result<(), LogError> {
        self.log.truncate(upto)?;
        // Whole-log compaction leaves no segments behind; recreate the
        // log so first/last stay aligned with the entry indexes.
        if self.log.segment_count() == 0 {
            self.log.reset_to(upto + 1)?;
        }
        Ok(())
    }

    /// The underlying log only appends, so a suffix truncation rebuilds
    /// the store from the surviving prefix. The suffix being discarded is
    /// uncommitted and therefore short.
    fn truncate_suffix(&self, from: u64) -> Result<(), LogError> {
        let first = self.first_index();
        let last = self.last_index();
        if from > last {
            return Ok(());
        }
        let mut keep = Vec::new();
        for index in first..from.max(first) {
            keep.push(self.log.read(index)?);
        }
        self.log.reset_to(first)?;
        for mut record in keep {
            self.log.append(&mut record)?;
        }
        Ok(())
    }

    fn reset(&self, next_index: u64) -> Result<(), LogError> {
        self.log.reset_to(next_index)
    }

    fn close(&self) -> Result<(), LogError> {
        self.log.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(index: u64, term: u64, data: &str) -> Entry {
        Entry {
            index,
            term,
            kind: EntryKind::Command,
            data: data.as_bytes().to_vec(),
        }
    }

    fn open_store(dir: &std::path::Path) -> LogEntryStore {
        LogEntryStore::open(dir, &SegmentConfig::default()).unwrap()
    }

    #[test]
    fn indexes_align_with_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);

        store
            .append(&[command(1, 1, "a"), command(2, 1, "b"), command(3, 2, "c")])
            .unwrap();
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 3);

        let entry = store.entry(2).unwrap();
        assert_eq!(entry.index, 2);
        assert_eq!(entry.data, b"b");
        assert_eq!(store.term_of(3).unwrap(), 2);
    }

    #[test]
    fn append_rejects_misaligned_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(matches!(
            store.append(&[command(5, 1, "gap")]),
            Err(LogError::IndexMismatch {
                expected: 5,
                assigned: 1
            })
        ));
    }

    #[test]
    fn truncate_suffix_rebuilds_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .append(&[command(1, 1, "a"), command(2, 1, "b"), command(3, 1, "c")])
            .unwrap();

        store.truncate_suffix(2).unwrap();
        assert_eq!(store.last_index(), 1);
        assert_eq!(store.entry(1).unwrap().data, b"a");

        // The store accepts replacement entries at the truncated indexes.
        store
            .append(&[command(2, 2, "b2"), command(3, 2, "c2")])
            .unwrap();
        assert_eq!(store.term_of(2).unwrap(), 2);
        assert_eq!(store.entry(3).unwrap().data, b"c2");
    }

    #[test]
    fn reset_moves_the_index_floor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(&[command(1, 1, "a")]).unwrap();

        store.reset(8).unwrap();
        assert_eq!(store.first_index(), 8);
        assert_eq!(store.last_index(), 7);

        store.append(&[command(8, 3, "post-snapshot")]).unwrap();
        assert_eq!(store.entry(8).unwrap().data, b"post-snapshot");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.append(&[command(1, 1, "a"), command(2, 1, "b")]).unwrap();
            store.close().unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(1).unwrap().data, b"a");
    }
}
