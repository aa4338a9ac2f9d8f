//! Immutable segment variants and the pluggable open/compact seams.
//!
//! A segment name is bound to at most one live representation at a time:
//! either a mutable [`LdbSegment`](crate::table::ldb::LdbSegment) held by the
//! table's writable tier, or one of the immutable variants here, held by the
//! segment set. The compactor converts between the two under the table's
//! write lock.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::table::file::{FileSegment, FileSegmentWriter, FILE_SEGMENT_MAGIC};
use crate::table::ldb::{LdbSegment, LDB_WAL_FILE};
use crate::table::mock::MockSegment;
use crate::Error;

/// Suffix for half-written conversion targets; directory scans skip these.
const TMP_SUFFIX: &str = ".tmp";

/// An immutable segment.
///
/// Optional capabilities are methods on the variants rather than runtime
/// probes: `open` is meaningful for file-backed segments, and `purge`
/// destroys the backing resource where one exists.
#[derive(Debug)]
pub enum Segment {
    File(FileSegment),
    Mock(MockSegment),
}

impl Segment {
    pub fn name(&self) -> &str {
        match self {
            Segment::File(s) => s.name(),
            Segment::Mock(s) => s.name(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Segment::File(s) => s.path(),
            Segment::Mock(s) => s.path(),
        }
    }

    pub fn open(&self) -> Result<()> {
        match self {
            Segment::File(s) => s.open(),
            Segment::Mock(s) => s.open(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Segment::File(s) => s.close(),
            Segment::Mock(s) => s.close(),
        }
    }

    /// Whether eviction should purge this segment instead of closing it.
    /// Local file segments only close: their file is the sole copy of the
    /// data. Purge-on-eviction is for variants caching a remote resource.
    pub fn is_purgeable(&self) -> bool {
        match self {
            Segment::File(_) => false,
            Segment::Mock(s) => s.is_purgeable(),
        }
    }

    pub fn purge(&self) -> Result<()> {
        match self {
            Segment::File(s) => s.purge(),
            Segment::Mock(s) => s.purge(),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self {
            Segment::File(s) => s.has(key),
            Segment::Mock(s) => s.has(key),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Segment::File(s) => s.get(key),
            Segment::Mock(s) => s.get(key),
        }
    }

    /// Ordered iterator over all entries.
    pub fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>> {
        match self {
            Segment::File(s) => Ok(Box::new(s.iter()?)),
            Segment::Mock(s) => Ok(Box::new(s.iter())),
        }
    }
}

/// On-disk representation of a segment, determined by probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Mutable directory with a write-ahead log.
    Ldb,
    /// Immutable single-file segment.
    File,
}

/// Determines the segment type at `path` by inspecting the directory layout
/// or the file's leading magic.
pub fn probe_segment_kind(path: &Path) -> Result<SegmentKind> {
    let meta = std::fs::metadata(path)?;

    if meta.is_dir() {
        if path.join(LDB_WAL_FILE).exists() {
            return Ok(SegmentKind::Ldb);
        }
        return Err(Error::InvalidSegmentType(path.display().to_string()));
    }

    let mut magic = [0u8; 4];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(path)?;
        if file.read(&mut magic)? < magic.len() {
            return Err(Error::InvalidSegmentType(path.display().to_string()));
        }
    }
    if magic == FILE_SEGMENT_MAGIC {
        Ok(SegmentKind::File)
    } else {
        Err(Error::SegmentTypeUnknown(path.display().to_string()))
    }
}

/// Lists segment directories and opens immutable segments from disk.
pub trait SegmentOpener: Send + Sync {
    /// Returns the segment names present under `path`, sorted ascending.
    fn list_segment_names(&self, path: &Path, table: &str) -> Result<Vec<String>>;

    /// Returns a handle to the named immutable segment. The segment is not
    /// opened; the segment set does that on first acquisition.
    fn open_segment(&self, table: &str, name: &str, path: &Path) -> Result<Segment>;
}

/// Converts segments between their mutable and immutable forms.
///
/// Both directions stage their output under a temporary path and rename at
/// the end, so a future dropped mid-conversion leaves no live segment
/// behind, only a temporary the next directory scan ignores.
#[async_trait::async_trait]
pub trait SegmentCompactor: Send + Sync {
    /// Converts a mutable segment into an immutable one, destroying the
    /// mutable representation.
    async fn compact_segment(&self, table: &str, segment: &LdbSegment) -> Result<Segment>;

    /// Converts an immutable segment (already opened) back into a mutable
    /// one, destroying the immutable representation.
    async fn uncompact_segment(&self, table: &str, segment: &Segment) -> Result<LdbSegment>;
}

/// Opener for file-backed segments.
#[derive(Debug, Default)]
pub struct FileSegmentOpener;

impl FileSegmentOpener {
    pub fn new() -> Self {
        Self
    }
}

impl SegmentOpener for FileSegmentOpener {
    fn list_segment_names(&self, path: &Path, _table: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        Ok(names)
    }

    fn open_segment(&self, _table: &str, name: &str, path: &Path) -> Result<Segment> {
        match probe_segment_kind(path)? {
            SegmentKind::File => Ok(Segment::File(FileSegment::new(name, path))),
            SegmentKind::Ldb => Err(Error::InvalidSegmentType(path.display().to_string())),
        }
    }
}

/// Compactor converting between the log-backed mutable form and the
/// single-file immutable form, in place.
#[derive(Debug, Default)]
pub struct FileSegmentCompactor;

impl FileSegmentCompactor {
    pub fn new() -> Self {
        Self
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(TMP_SUFFIX);
        PathBuf::from(os)
    }
}

#[async_trait::async_trait]
impl SegmentCompactor for FileSegmentCompactor {
    async fn compact_segment(&self, table: &str, segment: &LdbSegment) -> Result<Segment> {
        let path = segment.path().to_path_buf();
        let tmp = Self::tmp_path(&path);

        let mut writer = FileSegmentWriter::create(&tmp)?;
        for (key, value) in segment.iter() {
            writer.add(&key, &value)?;
        }
        writer.finish()?;

        segment.close()?;
        std::fs::remove_dir_all(&path)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(table, name = segment.name(), "Compacted segment file");
        Ok(Segment::File(FileSegment::new(segment.name(), path)))
    }

    async fn uncompact_segment(&self, table: &str, segment: &Segment) -> Result<LdbSegment> {
        let path = segment.path().to_path_buf();
        let tmp = Self::tmp_path(&path);

        {
            let staged = LdbSegment::open(segment.name(), &tmp)?;
            for entry in segment.iter()? {
                let (key, value) = entry?;
                staged.put(&key, &value)?;
            }
            staged.sync()?;
        }

        std::fs::remove_file(&path)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(table, name = segment.name(), "Uncompacted segment file");
        LdbSegment::open(segment.name(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_compact_uncompact_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");

        let ldb = LdbSegment::open("0001", &path).expect("open ldb");
        ldb.put(b"a", b"1").expect("put");
        ldb.put(b"b", b"2").expect("put");

        let compactor = FileSegmentCompactor::new();
        let segment = compactor.compact_segment("blocks", &ldb).await.expect("compact");
        drop(ldb);

        assert!(path.is_file());
        segment.open().expect("open file segment");
        assert_eq!(segment.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(segment.get(b"b").unwrap(), Some(b"2".to_vec()));

        let ldb = compactor
            .uncompact_segment("blocks", &segment)
            .await
            .expect("uncompact");
        assert!(path.is_dir());
        assert_eq!(ldb.get(b"a").unwrap(), Some(b"1".to_vec()));
        ldb.put(b"c", b"3").expect("writable again");
    }

    #[test]
    fn test_probe_kinds() {
        let dir = tempdir().expect("tempdir");

        let ldb_path = dir.path().join("0001");
        let ldb = LdbSegment::open("0001", &ldb_path).expect("open");
        drop(ldb);
        assert_eq!(probe_segment_kind(&ldb_path).unwrap(), SegmentKind::Ldb);

        let file_path = dir.path().join("0002");
        let writer = FileSegmentWriter::create(&file_path).expect("create");
        writer.finish().expect("finish");
        assert_eq!(probe_segment_kind(&file_path).unwrap(), SegmentKind::File);

        let unknown = dir.path().join("0003");
        std::fs::write(&unknown, b"PNG\x89 not a segment").unwrap();
        assert!(matches!(
            probe_segment_kind(&unknown),
            Err(Error::SegmentTypeUnknown(_))
        ));

        let short = dir.path().join("0004");
        std::fs::write(&short, b"ab").unwrap();
        assert!(matches!(
            probe_segment_kind(&short),
            Err(Error::InvalidSegmentType(_))
        ));
    }

    #[test]
    fn test_listing_skips_temporaries() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("0001"), b"x").unwrap();
        std::fs::write(dir.path().join("0002.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let opener = FileSegmentOpener::new();
        let names = opener.list_segment_names(dir.path(), "blocks").unwrap();
        assert_eq!(names, vec!["0001".to_string()]);
    }
}
