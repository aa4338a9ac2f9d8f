//! In-memory segment double used by tests exercising the segment set and
//! table lifecycle without touching disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Lifecycle counters observable after the segment has been handed to a
/// `SegmentSet`.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    purges: Arc<AtomicUsize>,
}

impl MockStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn purges(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockSegment {
    name: String,
    path: PathBuf,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    purgeable: bool,
    stats: MockStats,
}

impl MockSegment {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let path = PathBuf::from(format!("/mock/{name}"));
        Self {
            name,
            path,
            data: BTreeMap::new(),
            purgeable: false,
            stats: MockStats::default(),
        }
    }

    pub fn with_entry(mut self, key: &[u8], value: &[u8]) -> Self {
        self.data.insert(key.to_vec(), value.to_vec());
        self
    }

    pub fn purgeable(mut self, purgeable: bool) -> Self {
        self.purgeable = purgeable;
        self
    }

    /// Clonable handle to the lifecycle counters; take it before moving the
    /// segment into a set.
    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    pub fn open(&self) -> Result<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn purge(&self) -> Result<()> {
        self.stats.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send {
        self.data
            .clone()
            .into_iter()
            .map(Ok)
            .collect::<Vec<_>>()
            .into_iter()
    }
}
