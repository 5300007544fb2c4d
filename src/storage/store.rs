//! Append-only byte store backing one segment.
//!
//! Records are laid out as `[u64 BE length][payload]` with no header or
//! footer. Writes go through a buffer to amortize syscalls, so reads must
//! flush first to observe in-flight writes.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::LogError;

/// Width of the length prefix in front of every stored record.
pub(crate) const LEN_WIDTH: u64 = 8;

pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    writer: BufWriter<File>,
    reader: File,
    size: u64,
}

impl Store {
    /// Opens or creates the store file at `path`, picking up the size of
    /// any bytes already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let reader = file.try_clone()?;
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                writer: BufWriter::new(file),
                reader,
                size,
            }),
        })
    }

    /// Appends a length-prefixed record, returning the number of bytes
    /// written and the position the record starts at.
    pub fn append(&self, data: &[u8]) -> Result<(u64, u64), LogError> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.writer.write_all(&(data.len() as u64).to_be_bytes())?;
        inner.writer.write_all(data)?;
        let written = LEN_WIDTH + data.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Reads the record whose length prefix starts at `pos`.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>, LogError> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner.reader.read_exact_at(&mut len_buf, pos)?;
        let len = u64::from_be_bytes(len_buf);
        let mut data = vec![0u8; len as usize];
        inner.reader.read_exact_at(&mut data, pos + LEN_WIDTH)?;
        Ok(data)
    }

    /// Positional read of raw store bytes into `buf` starting at `off`.
    /// Returns the number of bytes read; zero past the end of the store.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, LogError> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        if off >= inner.size {
            return Ok(0);
        }
        let want = ((inner.size - off) as usize).min(buf.len());
        inner.reader.read_exact_at(&mut buf[..want], off)?;
        Ok(want)
    }

    /// Accepted byte count, buffered writes included.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and syncs the file. The store does not sync per append.
    pub fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("0.store")).unwrap();

        let payload = b"hello world";
        let want_width = LEN_WIDTH + payload.len() as u64;
        let mut positions = Vec::new();
        for i in 0..3u64 {
            let (n, pos) = store.append(payload).unwrap();
            assert_eq!(n, want_width);
            assert_eq!(pos, i * want_width);
            positions.push(pos);
        }

        for pos in positions {
            assert_eq!(store.read(pos).unwrap(), payload);
        }
        assert_eq!(store.size(), 3 * want_width);
        store.close().unwrap();
    }

    #[test]
    fn read_at_returns_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("0.store")).unwrap();
        store.append(b"abc").unwrap();

        let mut buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(buf), 3);

        let mut body = [0u8; 3];
        store.read_at(&mut body, LEN_WIDTH).unwrap();
        assert_eq!(&body, b"abc");

        let mut past = [0u8; 4];
        assert_eq!(store.read_at(&mut past, store.size()).unwrap(), 0);
    }

    #[test]
    fn reopen_recovers_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.store");

        let store = Store::open(&path).unwrap();
        let (_, pos) = store.append(b"persisted").unwrap();
        store.close().unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.size(), LEN_WIDTH + 9);
        assert_eq!(reopened.read(pos).unwrap(), b"persisted");
    }
}
