//! A segment pairs one store and one index under a base offset.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use prost::Message;

use crate::config::SegmentConfig;
use crate::error::LogError;
use crate::record::Record;
use crate::storage::index::OffsetIndex;
use crate::storage::store::Store;

pub struct Segment {
    store: Arc<Store>,
    index: OffsetIndex,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    /// Opens or creates `<base>.store` and `<base>.index` in `dir` and
    /// recovers `next_offset` from the index's last entry.
    pub fn open(dir: &Path, base_offset: u64, config: &SegmentConfig) -> Result<Self, LogError> {
        let store = Arc::new(Store::open(dir.join(format!("{base_offset}.store")))?);
        let index = OffsetIndex::open(
            dir.join(format!("{base_offset}.index")),
            config.max_index_bytes,
        )?;
        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + rel as u64 + 1,
            Err(LogError::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };
        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config: config.clone(),
        })
    }

    /// Appends `record`, assigning it the segment's next offset.
    ///
    /// The store write and the index write are not atomic: if the index
    /// write fails the store bytes stay behind as unreferenced garbage
    /// until the segment is removed. Readers never see them because no
    /// index entry points at them.
    pub fn append(&mut self, record: &mut Record) -> Result<u64, LogError> {
        let cur = self.next_offset;
        record.offset = cur;
        let buf = record.encode_to_vec();
        let (_, pos) = self.store.append(&buf)?;
        self.index.write((cur - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(cur)
    }

    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let data = self.store.read(pos)?;
        Ok(Record::decode(data.as_slice())?)
    }

    /// Whether the store or the index would refuse another entry. The
    /// log rotates to a fresh segment when this turns true.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
            || self.index.is_maxed()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn close(self) -> Result<(), LogError> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Closes the segment and deletes both files.
    pub fn remove(self) -> Result<(), LogError> {
        let index_path = self.index.path().to_path_buf();
        let store_path = self.store.path().to_path_buf();
        self.close()?;
        fs::remove_file(index_path)?;
        fs::remove_file(store_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::ENT_WIDTH;
    use crate::storage::store::LEN_WIDTH;

    #[test]
    fn append_read_and_max_out() {
        let dir = tempfile::tempdir().unwrap();
        let want = Record::new("hello world");

        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENT_WIDTH * 3,
            initial_offset: 0,
        };

        let mut segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let mut record = want.clone();
            let off = segment.append(&mut record).unwrap();
            assert_eq!(off, 16 + i);

            let got = segment.read(off).unwrap();
            assert_eq!(got.value, want.value);
            assert_eq!(got.offset, off);
        }

        // Index is full after three entries.
        let mut record = want.clone();
        assert!(matches!(
            segment.append(&mut record),
            Err(LogError::EndOfIndex)
        ));
        assert!(segment.is_maxed());
        segment.close().unwrap();

        // Reopen with a config the store bound maxes out under, proving
        // the segment rebuilds its state from the persisted files.
        let encoded_len = {
            let mut probe = want.clone();
            probe.offset = 16;
            probe.encode_to_vec().len() as u64
        };
        let config = SegmentConfig {
            max_store_bytes: (encoded_len + LEN_WIDTH) * 3,
            max_index_bytes: 1024,
            initial_offset: 0,
        };
        let segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 19);
        assert!(segment.is_maxed());

        segment.remove().unwrap();
        let segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert!(!segment.is_maxed());
        assert_eq!(segment.next_offset(), 16);
        segment.close().unwrap();
    }
}
