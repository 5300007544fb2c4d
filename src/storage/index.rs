//! Memory-mapped offset index.
//!
//! The index is a fixed array of 12-byte entries mapping a segment
//! relative offset (`u32 BE`) to a store position (`u64 BE`). The file is
//! pre-truncated to its configured capacity before mapping so appends
//! never remap, and truncated back to the occupied prefix on close so the
//! last-entry probe works from the physical file size on reopen.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::LogError;

pub(crate) const OFF_WIDTH: u64 = 4;
pub(crate) const POS_WIDTH: u64 = 8;
pub(crate) const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

pub struct OffsetIndex {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    size: u64,
}

impl OffsetIndex {
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            path,
            size,
        })
    }

    /// Reads the entry at `at`; `-1` addresses the last occupied entry.
    /// An empty index or an out-of-range slot yields `EndOfIndex`.
    pub fn read(&self, at: i64) -> Result<(u32, u64), LogError> {
        if self.size == 0 {
            return Err(LogError::EndOfIndex);
        }
        let slot = if at == -1 {
            self.size / ENT_WIDTH - 1
        } else if at < 0 {
            return Err(LogError::EndOfIndex);
        } else {
            at as u64
        };
        let pos = slot * ENT_WIDTH;
        if self.size < pos + ENT_WIDTH {
            return Err(LogError::EndOfIndex);
        }
        let pos = pos as usize;
        let mut off_buf = [0u8; OFF_WIDTH as usize];
        off_buf.copy_from_slice(&self.mmap[pos..pos + OFF_WIDTH as usize]);
        let mut pos_buf = [0u8; POS_WIDTH as usize];
        pos_buf.copy_from_slice(&self.mmap[pos + OFF_WIDTH as usize..pos + ENT_WIDTH as usize]);
        Ok((u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf)))
    }

    /// Appends an entry, failing with `EndOfIndex` when the mapping has
    /// no room for another one.
    pub fn write(&mut self, off: u32, pos: u64) -> Result<(), LogError> {
        if self.is_maxed() {
            return Err(LogError::EndOfIndex);
        }
        let at = self.size as usize;
        self.mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        self.mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());
        self.size += ENT_WIDTH;
        Ok(())
    }

    pub fn is_maxed(&self) -> bool {
        (self.mmap.len() as u64) < self.size + ENT_WIDTH
    }

    /// Occupied bytes, not the mapped capacity.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs the mapping and the file, then truncates the file back to
    /// the occupied prefix. The order matters: msync, fsync, truncate.
    pub fn close(self) -> Result<(), LogError> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = OffsetIndex::open(dir.path().join("0.index"), 1024).unwrap();

        assert!(matches!(index.read(-1), Err(LogError::EndOfIndex)));

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
            let (got_off, got_pos) = index.read(off as i64).unwrap();
            assert_eq!(got_off, off);
            assert_eq!(got_pos, pos);
        }

        let (last_off, last_pos) = index.read(-1).unwrap();
        assert_eq!(last_off, 1);
        assert_eq!(last_pos, 10);

        assert!(matches!(index.read(2), Err(LogError::EndOfIndex)));
        index.close().unwrap();
    }

    #[test]
    fn reopen_recovers_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");

        let mut index = OffsetIndex::open(&path, 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 23).unwrap();
        index.close().unwrap();

        // Close truncated the file back, so the reopen probe sees exactly
        // the occupied entries despite the capacity pre-truncation.
        let index = OffsetIndex::open(&path, 1024).unwrap();
        let (off, pos) = index.read(-1).unwrap();
        assert_eq!(off, 1);
        assert_eq!(pos, 23);
        index.close().unwrap();
    }

    #[test]
    fn write_fails_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = OffsetIndex::open(dir.path().join("0.index"), ENT_WIDTH * 2).unwrap();

        index.write(0, 0).unwrap();
        assert!(!index.is_maxed());
        index.write(1, 12).unwrap();
        assert!(index.is_maxed());
        assert!(matches!(index.write(2, 24), Err(LogError::EndOfIndex)));
        index.close().unwrap();
    }
}
