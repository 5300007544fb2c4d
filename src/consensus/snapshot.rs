//! On-disk snapshot store.
//!
//! Each snapshot gets its own directory named `<term>-<index>` holding a
//! `meta.json` and the raw `state.bin` byte stream. Writes land in a
//! `tmp-` directory first and are renamed into place on finalize, then
//! older snapshots are reaped so only the most recent ones remain.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::message::Configuration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last entry index the snapshot covers.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Membership at snapshot time.
    pub configuration: Configuration,
}

pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>, retain: usize) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    /// Starts a new snapshot. The returned sink collects the state bytes
    /// and publishes the snapshot on finalize.
    pub fn create(&self, meta: SnapshotMeta) -> io::Result<SnapshotSink> {
        let name = format!("{}-{}", meta.term, meta.index);
        let tmp_dir = self.dir.join(format!("tmp-{name}"));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let mut meta_file = File::create(tmp_dir.join("meta.json"))?;
        meta_file.write_all(&meta_bytes)?;
        meta_file.sync_all()?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_dir.join("state.bin"))?;

        Ok(SnapshotSink {
            file,
            tmp_dir,
            final_dir: self.dir.join(name),
            store_dir: self.dir.clone(),
            retain: self.retain,
        })
    }

    /// Writes a complete snapshot in one call (used when installing a
    /// snapshot received from the leader).
    pub fn save(&self, meta: SnapshotMeta, data: &[u8]) -> io::Result<()> {
        let mut sink = self.create(meta)?;
        sink.write_all(data)?;
        sink.finalize()
    }

    /// Opens the most recent snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<(SnapshotMeta, File)>> {
        let Some(dir) = latest_snapshot_dir(&self.dir)? else {
            return Ok(None);
        };
        let meta_bytes = fs::read(dir.join("meta.json"))?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes)?;
        let file = File::open(dir.join("state.bin"))?;
        Ok(Some((meta, file)))
    }
}

fn parse_snapshot_dir_name(name: &str) -> Option<(u64, u64)> {
    let (term, index) = name.split_once('-')?;
    Some((term.parse().ok()?, index.parse().ok()?))
}

fn snapshot_dirs(dir: &Path) -> io::Result<Vec<(u64, u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((term, index)) = parse_snapshot_dir_name(name) {
            found.push((index, term, entry.path()));
        }
    }
    // Newest first, ordered by covered index then term.
    found.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
    Ok(found)
}

fn latest_snapshot_dir(dir: &Path) -> io::Result<Option<PathBuf>> {
    Ok(snapshot_dirs(dir)?.into_iter().next().map(|(_, _, p)| p))
}

pub struct SnapshotSink {
    file: File,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    store_dir: PathBuf,
    retain: usize,
}

impl Write for SnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SnapshotSink {
    /// Publishes the snapshot and reaps older ones past the retention
    /// bound.
    pub fn finalize(self) -> io::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        if self.final_dir.exists() {
            fs::remove_dir_all(&self.final_dir)?;
        }
        fs::rename(&self.tmp_dir, &self.final_dir)?;

        for (_, _, stale) in snapshot_dirs(&self.store_dir)?.into_iter().skip(self.retain) {
            if let Err(e) = fs::remove_dir_all(&stale) {
                warn!("failed to reap stale snapshot {:?}: {}", stale, e);
            }
        }
        Ok(())
    }

    /// Abandons the snapshot, removing the temporary directory.
    pub fn cancel(self) {
        drop(self.file);
        let _ = fs::remove_dir_all(&self.tmp_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn meta(index: u64, term: u64) -> SnapshotMeta {
        SnapshotMeta {
            index,
            term,
            configuration: Configuration::default(),
        }
    }

    #[test]
    fn create_finalize_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 1).unwrap();
        assert!(store.latest().unwrap().is_none());

        let mut sink = store.create(meta(5, 2)).unwrap();
        sink.write_all(b"snapshot bytes").unwrap();
        sink.finalize().unwrap();

        let (got, mut file) = store.latest().unwrap().unwrap();
        assert_eq!(got.index, 5);
        assert_eq!(got.term, 2);
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"snapshot bytes");
    }

    #[test]
    fn retains_only_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 1).unwrap();

        store.save(meta(3, 1), b"old").unwrap();
        store.save(meta(9, 1), b"new").unwrap();

        let (got, _) = store.latest().unwrap().unwrap();
        assert_eq!(got.index, 9);

        let dirs = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_type().unwrap().is_dir())
            .count();
        assert_eq!(dirs, 1);
    }

    #[test]
    fn cancel_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 1).unwrap();

        let mut sink = store.create(meta(1, 1)).unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel();

        assert!(store.latest().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
