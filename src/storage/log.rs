//! The log: an ordered collection of segments with one active tail.

use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SegmentConfig;
use crate::error::LogError;
use crate::record::Record;
use crate::storage::segment::Segment;
use crate::storage::store::Store;

pub struct Log {
    dir: PathBuf,
    config: SegmentConfig,
    inner: RwLock<LogInner>,
}

struct LogInner {
    // Ordered by base offset; the last segment is the active one.
    segments: Vec<Segment>,
    closed: bool,
}

impl Log {
    /// Opens the log at `dir`, replaying existing segments from their
    /// filenames, or creates a fresh one at the configured initial
    /// offset.
    pub fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();
        let mut config = config;
        if config.max_store_bytes == 0 {
            config.max_store_bytes = 1024;
        }
        if config.max_index_bytes == 0 {
            config.max_index_bytes = 1024;
        }
        fs::create_dir_all(&dir)?;
        let segments = Self::setup(&dir, &config, config.initial_offset)?;
        Ok(Self {
            dir,
            config,
            inner: RwLock::new(LogInner {
                segments,
                closed: false,
            }),
        })
    }

    fn setup(
        dir: &Path,
        config: &SegmentConfig,
        initial_offset: u64,
    ) -> Result<Vec<Segment>, LogError> {
        // Each base offset shows up twice, once per extension.
        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(off) = stem.parse::<u64>() {
                    base_offsets.push(off);
                }
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::open(dir, base, config)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(dir, initial_offset, config)?);
        }
        Ok(segments)
    }

    /// Appends `record` to the active segment, rotating first when it is
    /// maxed. Returns the assigned offset.
    pub fn append(&self, record: &mut Record) -> Result<u64, LogError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let rotate_at = match inner.segments.last() {
            Some(active) if active.is_maxed() => Some(active.next_offset()),
            Some(_) => None,
            None => Some(self.config.initial_offset),
        };
        if let Some(base) = rotate_at {
            inner
                .segments
                .push(Segment::open(&self.dir, base, &self.config)?);
        }
        // The vec is non-empty here; rotation above guarantees a tail.
        let active = inner.segments.last_mut().ok_or(LogError::Closed)?;
        active.append(record)
    }

    /// Reads the record at `offset` from whichever segment holds it.
    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset())
            .ok_or(LogError::OffsetOutOfRange(offset))?;
        segment.read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.first().map_or(0, |s| s.base_offset())
    }

    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        match inner.segments.last().map(|s| s.next_offset()) {
            Some(0) | None => 0,
            Some(next) => next - 1,
        }
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    /// Removes every segment whose records all fall at or below
    /// `lowest`; the rest are retained in order.
    pub fn truncate(&self, lowest: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let segments = mem::take(&mut inner.segments);
        let mut retained = Vec::with_capacity(segments.len());
        let mut result = Ok(());
        for segment in segments {
            if result.is_ok() && segment.next_offset() <= lowest + 1 {
                if let Err(e) = segment.remove() {
                    result = Err(e);
                }
            } else {
                retained.push(segment);
            }
        }
        inner.segments = retained;
        result
    }

    /// Returns a reader over the raw store bytes of every segment, in
    /// order from position zero. This is the byte view snapshots are
    /// built from.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        LogReader {
            stores: inner.segments.iter().map(|s| s.store()).collect(),
            current: 0,
            pos: 0,
        }
    }

    pub fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write();
        Self::close_inner(&mut inner)
    }

    fn close_inner(inner: &mut LogInner) -> Result<(), LogError> {
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        for segment in inner.segments.drain(..) {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write();
        Self::close_inner(&mut inner)?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes the log and recreates it empty at the configured initial
    /// offset.
    pub fn reset(&self) -> Result<(), LogError> {
        self.reset_to(self.config.initial_offset)
    }

    /// Removes the log and recreates it empty with `initial_offset` as
    /// the base of the first segment. Restore uses this to rebuild a log
    /// whose snapshot does not start at zero.
    pub fn reset_to(&self, initial_offset: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write();
        Self::close_inner(&mut inner)?;
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        inner.segments = Self::setup(&self.dir, &self.config, initial_offset)?;
        inner.closed = false;
        Ok(())
    }
}

/// Concatenated byte view over segment stores. Single-threaded; each
/// store is read fully, in order, from position zero.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    pos: u64,
}

impl io::Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(store) = self.stores.get(self.current) else {
                return Ok(0);
            };
            let n = store.read_at(buf, self.pos)?;
            if n == 0 {
                self.current += 1;
                self.pos = 0;
                continue;
            }
            self.pos += n as u64;
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::ENT_WIDTH;
    use crate::storage::store::LEN_WIDTH;
    use prost::Message;
    use std::io::Read;

    fn test_config() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }

    #[test]
    fn append_and_read_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();

        let mut record = Record::new("hello world");
        let off = log.append(&mut record).unwrap();
        assert_eq!(off, 0);

        let read = log.read(off).unwrap();
        assert_eq!(read.value, b"hello world");
        assert_eq!(read.offset, 0);
        log.close().unwrap();
    }

    #[test]
    fn offset_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();

        match log.read(1) {
            Err(LogError::OffsetOutOfRange(off)) => assert_eq!(off, 1),
            other => panic!("expected out of range, got {other:?}"),
        }
        log.close().unwrap();
    }

    #[test]
    fn init_with_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();
        for _ in 0..3 {
            log.append(&mut Record::new("hello world")).unwrap();
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        log.close().unwrap();

        let log = Log::open(dir.path(), test_config()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        for off in 0..3 {
            assert_eq!(log.read(off).unwrap().value, b"hello world");
        }
        log.close().unwrap();
    }

    #[test]
    fn rotation_under_small_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENT_WIDTH * 3,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();

        for i in 0..4u64 {
            let off = log.append(&mut Record::new("hello world")).unwrap();
            assert_eq!(off, i);
        }
        for off in 0..4 {
            assert_eq!(log.read(off).unwrap().value, b"hello world");
        }
        assert_eq!(log.segment_count(), 2);

        // Two file pairs on disk.
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 4);
        log.close().unwrap();
    }

    #[test]
    fn truncate_removes_stale_segments() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 32,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();
        for _ in 0..3 {
            log.append(&mut Record::new("hello world")).unwrap();
        }

        log.truncate(1).unwrap();

        assert!(matches!(log.read(0), Err(LogError::OffsetOutOfRange(0))));
        assert_eq!(log.read(2).unwrap().value, b"hello world");
        log.close().unwrap();
    }

    #[test]
    fn reader_yields_raw_store_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();
        let mut record = Record::new("hello world");
        let off = log.append(&mut record).unwrap();
        assert_eq!(off, 0);

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();

        let read = Record::decode(&bytes[LEN_WIDTH as usize..]).unwrap();
        assert_eq!(read.value, b"hello world");
        log.close().unwrap();
    }

    #[test]
    fn reset_to_restarts_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();
        log.append(&mut Record::new("old")).unwrap();

        log.reset_to(7).unwrap();
        assert_eq!(log.lowest_offset(), 7);
        assert_eq!(log.highest_offset(), 6);

        let off = log.append(&mut Record::new("new")).unwrap();
        assert_eq!(off, 7);
        log.close().unwrap();
    }
}
