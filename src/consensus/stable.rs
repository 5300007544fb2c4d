//! Durable key/value store for consensus metadata: current term, vote,
//! and the latest applied configuration.
//!
//! The whole map is rewritten atomically on every set (write to a temp
//! file, sync, rename). The values are tiny and writes are rare, so the
//! simplicity wins over an incremental format.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

pub struct StableStore {
    path: PathBuf,
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl StableStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let values = match File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                let (values, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                values
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_vec());
        self.persist(&values)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let bytes = self.get(key)?;
        let array: [u8; 8] = bytes.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(array))
    }

    pub fn set_u64(&self, key: &str, value: u64) -> io::Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    fn persist(&self, values: &HashMap<String, Vec<u8>>) -> io::Result<()> {
        let bytes = bincode::encode_to_vec(values, bincode::config::standard())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable");

        let store = StableStore::open(&path).unwrap();
        assert_eq!(store.get("current_term"), None);

        store.set_u64("current_term", 3).unwrap();
        store.set("voted_for", b"node-1").unwrap();
        assert_eq!(store.get_u64("current_term"), Some(3));

        let reopened = StableStore::open(&path).unwrap();
        assert_eq!(reopened.get_u64("current_term"), Some(3));
        assert_eq!(reopened.get("voted_for").as_deref(), Some(&b"node-1"[..]));
    }
}
