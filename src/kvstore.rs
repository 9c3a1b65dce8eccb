use std::path::Path;
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::errors::{ArchiveError, ArchiveResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Ordered byte-key store partitioned into prefix realms.
///
/// A realm is a cheap view over the same physical database that prepends its
/// prefix to every key. Iteration yields keys in lexicographic order of the
/// raw key bytes, which address-filtered scans rely on.
#[derive(Debug)]
pub struct KvStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    prefix: Vec<u8>,
    mode: AccessMode,
}

impl KvStore {
    pub fn open(path: &Path, mode: AccessMode) -> ArchiveResult<Self> {
        let mut opts = Options::default();
        let db = match mode {
            AccessMode::ReadOnly => {
                DBWithThreadMode::<MultiThreaded>::open_for_read_only(&opts, path, false)?
            }
            AccessMode::ReadWrite => {
                opts.create_if_missing(true);
                DBWithThreadMode::<MultiThreaded>::open(&opts, path)?
            }
        };
        Ok(Self {
            db: Arc::new(db),
            prefix: Vec::new(),
            mode,
        })
    }

    pub fn realm(&self, prefix: &[u8]) -> Self {
        let mut realm_prefix = self.prefix.clone();
        realm_prefix.extend_from_slice(prefix);
        Self {
            db: self.db.clone(),
            prefix: realm_prefix,
            mode: self.mode,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }

    pub fn get(&self, key: &[u8]) -> ArchiveResult<Option<Vec<u8>>> {
        Ok(self.db.get(self.full_key(key))?)
    }

    pub fn has(&self, key: &[u8]) -> ArchiveResult<bool> {
        Ok(self.db.get(self.full_key(key))?.is_some())
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> ArchiveResult<()> {
        self.db.put(self.full_key(key), value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> ArchiveResult<()> {
        self.db.delete(self.full_key(key))?;
        Ok(())
    }

    /// Deletes every key of the realm that starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &[u8]) -> ArchiveResult<()> {
        let full = self.full_key(prefix);
        let mut doomed = Vec::new();
        let iterator = self
            .db
            .iterator(IteratorMode::From(&full, Direction::Forward));
        for entry in iterator {
            let (key, _) = entry?;
            if !key.starts_with(&full) {
                break;
            }
            doomed.push(key);
        }
        for key in doomed {
            self.db.delete(key)?;
        }
        Ok(())
    }

    /// Iterates all entries whose key starts with `prefix`, in key order.
    /// Yielded keys have the realm prefix stripped.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = ArchiveResult<(Vec<u8>, Vec<u8>)>> + 'a {
        let full = self.full_key(prefix);
        let realm_len = self.prefix.len();
        let iterator = self
            .db
            .iterator(IteratorMode::From(&full, Direction::Forward));
        iterator
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(ArchiveError::from)
            })
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.starts_with(&full),
                Err(_) => true,
            })
            .map(move |entry| entry.map(|(key, value)| (key[realm_len..].to_vec(), value)))
    }

    pub fn flush(&self) -> ArchiveResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Closes the store handle. Write handles are flushed first so that data
    /// and any status markers written through them hit disk together.
    pub fn close(self) -> ArchiveResult<()> {
        if self.mode == AccessMode::ReadWrite {
            self.db.flush()?;
        }
        Ok(())
    }
}

impl Clone for KvStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            prefix: self.prefix.clone(),
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn realms_partition_the_key_space() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let left = store.realm(&[1]);
        let right = store.realm(&[2]);

        left.set(b"key", b"left").unwrap();
        right.set(b"key", b"right").unwrap();

        assert_eq!(left.get(b"key").unwrap().unwrap(), b"left");
        assert_eq!(right.get(b"key").unwrap().unwrap(), b"right");

        left.delete(b"key").unwrap();
        assert!(left.get(b"key").unwrap().is_none());
        assert_eq!(right.get(b"key").unwrap().unwrap(), b"right");
    }

    #[test]
    fn prefix_iteration_is_ordered_and_bounded() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let realm = store.realm(&[7]);

        realm.set(b"aa1", b"1").unwrap();
        realm.set(b"aa0", b"0").unwrap();
        realm.set(b"ab0", b"x").unwrap();
        store.realm(&[8]).set(b"aa9", b"other realm").unwrap();

        let keys: Vec<Vec<u8>> = realm
            .iter_prefix(b"aa")
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"aa0".to_vec(), b"aa1".to_vec()]);
    }

    #[test]
    fn delete_prefix_clears_only_matching_entries() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let realm = store.realm(&[9]);

        realm.set(b"aa0", b"").unwrap();
        realm.set(b"aa1", b"").unwrap();
        realm.set(b"bb0", b"").unwrap();

        realm.delete_prefix(b"aa").unwrap();
        assert!(realm.get(b"aa0").unwrap().is_none());
        assert!(realm.get(b"aa1").unwrap().is_none());
        assert!(realm.get(b"bb0").unwrap().is_some());
    }
}
