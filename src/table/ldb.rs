//! Mutable segment backed by an ordered in-memory map and a write-ahead log.
//!
//! A mutable segment is a directory holding a single log file. Mutations are
//! appended to the log first and then applied to a concurrent skip list, so
//! reads see a sorted, always-current view while reopening the directory
//! rebuilds the same state by replay.

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::table::wal::Wal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Log file inside a mutable segment directory. Its presence is also what
/// identifies the directory as a mutable segment during type probing.
pub const LDB_WAL_FILE: &str = "segment.wal";

pub struct LdbSegment {
    name: String,
    path: PathBuf,
    data: SkipMap<Vec<u8>, Vec<u8>>,
    wal: Wal,
}

impl std::fmt::Debug for LdbSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdbSegment")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl LdbSegment {
    /// Opens the segment directory, creating it if needed, and replays the
    /// log into memory.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let name = name.into();
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let wal = Wal::open(path.join(LDB_WAL_FILE))?;
        let data = SkipMap::new();
        for entry in wal.replay()? {
            let (key, value) = entry?;
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }

        Ok(Self {
            name,
            path,
            data,
            wal,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.wal.append(key, Some(value))?;
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.wal.append(key, None)?;
        self.data.remove(key);
        Ok(())
    }

    /// Ordered iterator over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Last modification time of the segment's log, used by the compaction
    /// age check.
    pub fn modified_at(&self) -> Result<SystemTime> {
        Ok(std::fs::metadata(self.wal.path())?.modified()?)
    }

    /// Flushes buffered log appends to disk.
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.wal.sync()
    }
}

/// Buffered mutations against one mutable segment, applied by `write`.
pub struct LdbBatch {
    segment: Arc<LdbSegment>,
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    value_size: usize,
}

impl LdbBatch {
    pub fn new(segment: Arc<LdbSegment>) -> Self {
        Self {
            segment,
            ops: Vec::new(),
            value_size: 0,
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.value_size += value.len();
        self.ops.push((key.to_vec(), Some(value.to_vec())));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push((key.to_vec(), None));
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Applies the buffered operations in order.
    pub fn write(&mut self) -> Result<()> {
        for (key, value) in self.ops.drain(..) {
            match value {
                Some(value) => self.segment.put(&key, &value)?,
                None => self.segment.delete(&key)?,
            }
        }
        self.value_size = 0;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.ops.clear();
        self.value_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().expect("tempdir");
        let segment = LdbSegment::open("0001", dir.path().join("0001")).expect("open");

        segment.put(b"key1", b"value1").expect("put");
        segment.put(b"key2", b"value2").expect("put");

        assert_eq!(segment.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert!(segment.has(b"key2").unwrap());
        assert_eq!(segment.get(b"key3").unwrap(), None);

        segment.delete(b"key1").expect("delete");
        assert_eq!(segment.get(b"key1").unwrap(), None);
        assert!(!segment.has(b"key1").unwrap());
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");

        {
            let segment = LdbSegment::open("0001", &path).expect("open");
            segment.put(b"a", b"1").expect("put");
            segment.put(b"b", b"2").expect("put");
            segment.delete(b"a").expect("delete");
            segment.close().expect("close");
        }

        let segment = LdbSegment::open("0001", &path).expect("reopen");
        assert_eq!(segment.get(b"a").unwrap(), None);
        assert_eq!(segment.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(segment.len(), 1);
    }

    #[test]
    fn test_iter_is_ordered() {
        let dir = tempdir().expect("tempdir");
        let segment = LdbSegment::open("0001", dir.path().join("0001")).expect("open");

        segment.put(b"c", b"3").expect("put");
        segment.put(b"a", b"1").expect("put");
        segment.put(b"b", b"2").expect("put");

        let keys: Vec<_> = segment.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_batch_applies_in_order() {
        let dir = tempdir().expect("tempdir");
        let segment = Arc::new(LdbSegment::open("0001", dir.path().join("0001")).expect("open"));

        let mut batch = LdbBatch::new(segment.clone());
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        assert_eq!(batch.value_size(), 2);

        batch.write().expect("write");
        assert_eq!(segment.get(b"a").unwrap(), None);
        assert_eq!(segment.get(b"b").unwrap(), Some(b"2".to_vec()));
    }
}
