//! Partitioned key/value table.
//!
//! A table is a directory of segments. The partitioner routes every key to a
//! segment name; the lexicographically greatest name ever created as mutable
//! is the *active* segment and only names at or above it may be created
//! fresh. Older mutable segments age out into immutable files through the
//! compactor, and a write that lands on an already-compacted name forces the
//! inverse conversion first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::RwLock;

use crate::config::TableConfig;
use crate::error::Result;
use crate::table::batch::TableBatch;
use crate::table::ldb::LdbSegment;
use crate::table::partition::Partitioner;
use crate::table::segment::{
    probe_segment_kind, FileSegmentCompactor, FileSegmentOpener, SegmentCompactor, SegmentKind,
    SegmentOpener,
};
use crate::table::set::{SegmentHandle, SegmentSet};
use crate::Error;

/// A segment acquired for reading. Mutable segments are returned directly
/// and cost nothing; immutable ones hold a semaphore permit released on
/// drop.
pub enum AcquiredSegment {
    Ldb(Arc<LdbSegment>),
    Immutable(SegmentHandle),
}

impl AcquiredSegment {
    pub fn name(&self) -> &str {
        match self {
            AcquiredSegment::Ldb(s) => s.name(),
            AcquiredSegment::Immutable(s) => s.name(),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self {
            AcquiredSegment::Ldb(s) => s.has(key),
            AcquiredSegment::Immutable(s) => s.has(key),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            AcquiredSegment::Ldb(s) => s.get(key),
            AcquiredSegment::Immutable(s) => s.get(key),
        }
    }
}

struct TableState {
    active: String,
    ldb_segments: HashMap<String, Arc<LdbSegment>>,
}

/// Key/value storage for one data type, split into segments by a
/// partitioner.
pub struct Table {
    name: String,
    path: PathBuf,
    config: TableConfig,
    partitioner: Box<dyn Partitioner>,
    opener: Box<dyn SegmentOpener>,
    compactor: Box<dyn SegmentCompactor>,

    state: RwLock<TableState>,
    segments: SegmentSet,
}

impl Table {
    /// Opens the table at `path` with the default file-backed opener and
    /// compactor, scanning the directory for existing segments.
    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        partitioner: impl Partitioner + 'static,
        config: TableConfig,
    ) -> Result<Self> {
        Self::open_with(
            name,
            path,
            partitioner,
            config,
            Box::new(FileSegmentOpener::new()),
            Box::new(FileSegmentCompactor::new()),
        )
    }

    pub fn open_with(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        partitioner: impl Partitioner + 'static,
        config: TableConfig,
        opener: Box<dyn SegmentOpener>,
        compactor: Box<dyn SegmentCompactor>,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let segments = SegmentSet::new(config.max_open_segments);
        let mut active = String::new();
        let mut ldb_segments = HashMap::new();

        let names = opener.list_segment_names(&path, &name).map_err(|e| {
            tracing::error!(path = %path.display(), table = %name, error = %e, "Cannot list segment names");
            e
        })?;

        for segment_name in names {
            let segment_path = path.join(&segment_name);

            let kind = match probe_segment_kind(&segment_path) {
                Ok(kind) => kind,
                Err(Error::InvalidSegmentType(_)) => {
                    tracing::warn!(
                        path = %segment_path.display(),
                        name = %segment_name,
                        "Invalid segment type, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match kind {
                SegmentKind::Ldb => {
                    let ldb = LdbSegment::open(&segment_name, &segment_path).map_err(|e| {
                        tracing::error!(
                            path = %segment_path.display(),
                            name = %segment_name,
                            error = %e,
                            "Cannot open ldb segment"
                        );
                        e
                    })?;
                    ldb_segments.insert(segment_name.clone(), Arc::new(ldb));
                }
                SegmentKind::File => match opener.open_segment(&name, &segment_name, &segment_path)
                {
                    Ok(segment) => segments.add(segment)?,
                    Err(Error::SegmentTypeUnknown(_)) => {
                        tracing::info!(filename = %segment_name, "Unknown segment type, skipping");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(
                            path = %segment_path.display(),
                            table = %name,
                            name = %segment_name,
                            error = %e,
                            "Cannot open segment"
                        );
                        return Err(e);
                    }
                },
            }

            if segment_name > active {
                active = segment_name;
            }
        }

        Ok(Self {
            name,
            path,
            config,
            partitioner: Box::new(partitioner),
            opener,
            compactor,
            state: RwLock::new(TableState {
                active,
                ldb_segments,
            }),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Closes all segments within the table.
    pub async fn close(&self) -> Result<()> {
        let state = self.state.write().await;
        for segment in state.ldb_segments.values() {
            if let Err(e) = segment.close() {
                tracing::error!(
                    path = %segment.path().display(),
                    name = segment.name(),
                    error = %e,
                    "Failed to close ldb segment"
                );
            }
        }
        self.segments.close()
    }

    /// Name of the current active segment; empty until a segment exists.
    pub async fn active_segment_name(&self) -> String {
        self.state.read().await.active.clone()
    }

    /// The active mutable segment, if one exists.
    pub async fn active_segment(&self) -> Option<Arc<LdbSegment>> {
        let state = self.state.read().await;
        state.ldb_segments.get(&state.active).cloned()
    }

    /// Sorted names of every segment in the table, both tiers.
    pub async fn segment_names(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.ldb_segments.keys().cloned().collect();
        for segment in self.segments.slice()? {
            names.push(segment.name().to_string());
        }
        names.sort();
        Ok(names)
    }

    pub(crate) fn partition(&self, key: &[u8]) -> String {
        self.partitioner.partition(key)
    }

    /// Acquires the named segment for reading. Returns `None` if it does not
    /// exist in either tier.
    pub async fn acquire_segment(&self, name: &str) -> Result<Option<AcquiredSegment>> {
        {
            let state = self.state.read().await;
            if let Some(segment) = state.ldb_segments.get(name) {
                return Ok(Some(AcquiredSegment::Ldb(segment.clone())));
            }
        }
        Ok(self.segments.acquire(name).await?.map(AcquiredSegment::Immutable))
    }

    /// Returns true if `key` exists in the table.
    pub async fn has(&self, key: &[u8]) -> Result<bool> {
        let name = self.partition(key);
        match self.acquire_segment(&name).await? {
            Some(segment) => segment.has(key),
            None => Ok(false),
        }
    }

    /// Returns the value associated with `key`, or `None`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let name = self.partition(key);
        match self.acquire_segment(&name).await? {
            Some(segment) => segment.get(key),
            None => Ok(None),
        }
    }

    /// Associates a value with `key`. A put of the current value is a no-op.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(current) = self.get(key).await? {
            if current == value {
                return Ok(());
            }
        }

        let name = self.partition(key);
        let segment = self.create_segment_if_not_exists(&name).await?;
        segment.put(key, value)
    }

    /// Removes `key`. Deleting from a compacted partition fails with
    /// `ImmutableSegment`; a missing partition is a no-op.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let name = self.partition(key);
        match self.acquire_segment(&name).await? {
            Some(AcquiredSegment::Ldb(segment)) => segment.delete(key),
            Some(AcquiredSegment::Immutable(_)) => Err(Error::ImmutableSegment),
            None => Ok(()),
        }
    }

    pub fn new_batch(&self) -> TableBatch<'_> {
        TableBatch::new(self)
    }

    /// Returns the named mutable segment, creating it if needed.
    ///
    /// A name present in the immutable tier is uncompacted back into a
    /// mutable segment. A new name must be at or above the active name; the
    /// active name is promoted and compaction runs before returning.
    pub async fn create_segment_if_not_exists(&self, name: &str) -> Result<Arc<LdbSegment>> {
        {
            let state = self.state.read().await;
            if let Some(segment) = state.ldb_segments.get(name) {
                return Ok(segment.clone());
            }
        }

        let mut state = self.state.write().await;

        // Recheck under the write lock.
        if let Some(segment) = state.ldb_segments.get(name) {
            return Ok(segment.clone());
        }

        // Uncompact the segment if it has already become compacted.
        if self.segments.contains(name)? {
            return self.uncompact(&mut state, name).await;
        }

        // Only the active name may move forward.
        if name < state.active.as_str() {
            tracing::error!(name, active = %state.active, "Cannot create non-active segment");
            return Err(Error::ImmutableSegment);
        }

        let segment = Arc::new(LdbSegment::open(name, self.segment_path(name))?);
        state.ldb_segments.insert(name.to_string(), segment.clone());
        state.active = name.to_string();

        // Compact under lock; the background task handles the steady state.
        self.compact_locked(&mut state).await?;

        Ok(segment)
    }

    /// Converts aged mutable segments into immutable files.
    pub async fn compact(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.compact_locked(&mut state).await
    }

    async fn compact_locked(&self, state: &mut TableState) -> Result<()> {
        let mut ldbs: Vec<Arc<LdbSegment>> = state.ldb_segments.values().cloned().collect();
        if ldbs.len() < self.config.min_mutable_segments {
            return Ok(());
        }
        ldbs.sort_by(|a, b| a.name().cmp(b.name()));

        let compactable = ldbs.len() - self.config.min_mutable_segments;
        for ldb in &ldbs[..compactable] {
            let start = Instant::now();

            let modified = ldb.modified_at()?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age < self.config.min_compaction_age {
                tracing::debug!(
                    table = %self.name,
                    name = ldb.name(),
                    "Ldb segment too young, skipping compaction"
                );
                continue;
            }

            let segment = self.compactor.compact_segment(&self.name, ldb).await?;
            self.segments.add(segment)?;
            state.ldb_segments.remove(ldb.name());

            tracing::info!(
                table = %self.name,
                name = ldb.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Compacted segment"
            );
        }
        Ok(())
    }

    /// Converts an immutable segment back to a mutable one.
    async fn uncompact(&self, state: &mut TableState, name: &str) -> Result<Arc<LdbSegment>> {
        let start = Instant::now();

        let handle = self
            .segments
            .acquire(name)
            .await?
            .ok_or(Error::NotFound)?;
        let ldb = Arc::new(
            self.compactor
                .uncompact_segment(&self.name, handle.segment())
                .await?,
        );
        state.ldb_segments.insert(name.to_string(), ldb.clone());

        // Release the permit before remove, which needs one of its own.
        drop(handle);
        self.segments.remove(name).await?;

        tracing::info!(
            table = %self.name,
            name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Uncompacted segment"
        );

        Ok(ldb)
    }

    /// The number of immutable segments currently known.
    pub fn immutable_segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn first_byte_partitioner() -> impl Partitioner + 'static {
        |key: &[u8]| format!("{:02x}", key.first().copied().unwrap_or(0))
    }

    fn test_config() -> TableConfig {
        TableConfig::default()
            .min_mutable_segments(1)
            .min_compaction_age(Duration::ZERO)
            .max_open_segments(4)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempdir().expect("tempdir");
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("open");

        table.put(b"\x01abc", b"a").await.expect("put");
        assert_eq!(table.get(b"\x01abc").await.unwrap(), Some(b"a".to_vec()));
        assert!(table.has(b"\x01abc").await.unwrap());
        assert_eq!(table.get(b"\x01zzz").await.unwrap(), None);
        assert!(!table.has(b"\x02abc").await.unwrap());

        table.delete(b"\x01abc").await.expect("delete");
        assert_eq!(table.get(b"\x01abc").await.unwrap(), None);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_active_name_is_monotonic() {
        let dir = tempdir().expect("tempdir");
        // Keep every segment mutable so no conversion interferes.
        let config = TableConfig::default().min_mutable_segments(8);
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), config)
            .expect("open");

        table.put(b"\x01a", b"1").await.expect("put");
        assert_eq!(table.active_segment_name().await, "01");

        table.put(b"\x05a", b"5").await.expect("put");
        assert_eq!(table.active_segment_name().await, "05");

        // A write into an older, still-mutable partition does not demote.
        table.put(b"\x01b", b"1b").await.expect("put");
        assert_eq!(table.active_segment_name().await, "05");

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_write_then_compact_still_readable() {
        let dir = tempdir().expect("tempdir");
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("open");

        table.put(b"\x01key", b"a").await.expect("put");
        table.put(b"\x02key", b"b").await.expect("put");
        assert_eq!(table.active_segment_name().await, "02");

        table.compact().await.expect("compact");

        // "01" is now immutable, "02" stays mutable.
        assert_eq!(table.immutable_segment_count(), 1);
        assert!(table.active_segment().await.is_some());
        assert_eq!(table.get(b"\x01key").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(table.get(b"\x02key").await.unwrap(), Some(b"b".to_vec()));

        // Deleting from the compacted partition is rejected.
        assert_eq!(
            table.delete(b"\x01key").await,
            Err(Error::ImmutableSegment)
        );

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_uncompact_on_write_back() {
        let dir = tempdir().expect("tempdir");
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("open");

        table.put(b"\x01key", b"a").await.expect("put");
        table.put(b"\x02key", b"b").await.expect("put");
        table.compact().await.expect("compact");
        assert_eq!(table.immutable_segment_count(), 1);

        // Writing into the compacted partition forces uncompaction.
        table.put(b"\x01key", b"a2").await.expect("put");
        assert_eq!(table.get(b"\x01key").await.unwrap(), Some(b"a2".to_vec()));
        assert_eq!(table.immutable_segment_count(), 0);

        let names = table.segment_names().await.unwrap();
        assert_eq!(names, vec!["01".to_string(), "02".to_string()]);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_no_name_in_both_tiers() {
        let dir = tempdir().expect("tempdir");
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("open");

        for b in 1u8..=4 {
            table.put(&[b, b], &[b]).await.expect("put");
        }
        table.compact().await.expect("compact");

        let state = table.state.read().await;
        for segment in table.segments.slice().unwrap() {
            assert!(!state.ldb_segments.contains_key(segment.name()));
        }
        drop(state);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_put_identical_value_short_circuits() {
        let dir = tempdir().expect("tempdir");
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("open");

        table.put(b"\x01k", b"v").await.expect("put");
        table.put(b"\x02k", b"v2").await.expect("put");
        table.compact().await.expect("compact");
        assert_eq!(table.immutable_segment_count(), 1);

        // Same value into the compacted partition: short-circuits before any
        // uncompaction.
        table.put(b"\x01k", b"v").await.expect("idempotent put");
        assert_eq!(table.immutable_segment_count(), 1);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_young_segments_skip_compaction() {
        let dir = tempdir().expect("tempdir");
        let config = test_config().min_compaction_age(Duration::from_secs(3600));
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), config)
            .expect("open");

        table.put(b"\x01k", b"a").await.expect("put");
        table.put(b"\x02k", b"b").await.expect("put");
        table.compact().await.expect("compact");

        // Both segments are younger than an hour, so nothing compacts.
        assert_eq!(table.immutable_segment_count(), 0);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_reads_cycle_segments_through_small_cache() {
        let dir = tempdir().expect("tempdir");
        let config = test_config().max_open_segments(2);
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), config)
            .expect("open");

        for b in 1u8..=4 {
            table.put(&[b, b"k"[0]], &[b]).await.expect("put");
        }
        table.compact().await.expect("compact");
        assert_eq!(table.immutable_segment_count(), 3);

        // More immutable segments than the cache holds: reads must evict,
        // close, and reopen transparently, repeatedly.
        for _round in 0..3 {
            for b in 1u8..=4 {
                assert_eq!(
                    table.get(&[b, b"k"[0]]).await.unwrap(),
                    Some(vec![b]),
                    "partition {b:02x}"
                );
            }
        }

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_reopen_recovers_both_tiers() {
        let dir = tempdir().expect("tempdir");

        {
            let table =
                Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
                    .expect("open");
            table.put(b"\x01key", b"a").await.expect("put");
            table.put(b"\x02key", b"b").await.expect("put");
            table.compact().await.expect("compact");
            table.close().await.expect("close");
        }

        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), test_config())
            .expect("reopen");
        assert_eq!(table.active_segment_name().await, "02");
        assert_eq!(table.get(b"\x01key").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(table.get(b"\x02key").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(table.immutable_segment_count(), 1);

        table.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_batch_routes_per_segment() {
        let dir = tempdir().expect("tempdir");
        // Keep target segments mutable while the batch is outstanding.
        let config = TableConfig::default().min_mutable_segments(8);
        let table = Table::open("blocks", dir.path(), first_byte_partitioner(), config)
            .expect("open");

        let mut batch = table.new_batch();
        batch.put(b"\x01a", b"1").await.expect("put");
        batch.put(b"\x02b", b"2").await.expect("put");
        batch.put(b"\x02c", b"3").await.expect("put");
        assert_eq!(batch.value_size(), 3);

        // Nothing visible until write.
        assert_eq!(table.get(b"\x01a").await.unwrap(), None);

        batch.write().expect("write");
        assert_eq!(table.get(b"\x01a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"\x02b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(table.get(b"\x02c").await.unwrap(), Some(b"3".to_vec()));

        table.close().await.expect("close");
    }
}
