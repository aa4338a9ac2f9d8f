//! Immutable single-file segment.
//!
//! Produced by the compactor from an aged mutable segment and opened lazily
//! by the segment set. The file carries a magic header so directory scans can
//! probe its type without opening it fully.
//!
//! # File Layout
//!
//! ```text
//! +----------------------+
//! | Magic "SEGF" (4B)    |
//! | Version u16 + pad    |
//! +----------------------+
//! | Data Block 1         |
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Data Block N         |
//! +----------------------+
//! | Index Block          |
//! +----------------------+
//! | Footer (16B)         |
//! +----------------------+
//! ```
//!
//! Each data block is a run of `key_len u32 | key | val_len u32 | value`
//! records followed by a CRC32 of the run. The index block is the sorted list
//! of `(first_key, offset, size)` per data block; the footer stores the index
//! offset and length. All integers are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Leading magic identifying an immutable segment file.
pub const FILE_SEGMENT_MAGIC: [u8; 4] = *b"SEGF";
const FILE_SEGMENT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 8;
const FOOTER_SIZE: u64 = 16;

/// Target maximum size for a data block; the last record may push a block
/// slightly past it.
pub const MAX_BLOCK_SIZE: usize = 4096;

struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    size: u64,
}

/// Read-only, lazily opened segment file.
///
/// The handle starts closed; `open` loads the sparse index and keeps the
/// file descriptor until `close` or `purge`.
pub struct FileSegment {
    name: String,
    path: PathBuf,
    inner: RwLock<Option<Opened>>,
}

struct Opened {
    file: File,
    index: Vec<IndexEntry>,
}

impl std::fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSegment")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl FileSegment {
    /// Returns an unopened handle to the segment file at `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            inner: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Opens the file and loads its index. A second open is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut guard = self.inner.write()?;
        if guard.is_some() {
            return Ok(());
        }

        let mut file = File::open(&self.path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::InvalidSegmentType(self.path.display().to_string()));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if header[..4] != FILE_SEGMENT_MAGIC {
            return Err(Error::SegmentTypeUnknown(self.path.display().to_string()));
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != FILE_SEGMENT_VERSION {
            return Err(Error::InvalidSegmentType(format!(
                "{}: version {version}",
                self.path.display()
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        let index_len = file.read_u64::<BigEndian>()?;
        if index_offset
            .checked_add(index_len)
            .map_or(true, |end| end > file_size - FOOTER_SIZE)
        {
            return Err(Error::Corrupted(format!(
                "segment index out of bounds in {}",
                self.path.display()
            )));
        }

        let mut index_data = vec![0u8; index_len as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = decode_index(&index_data, &self.path)?;

        *guard = Some(Opened { file, index });
        Ok(())
    }

    /// Releases the file handle and index. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.write()?.take();
        Ok(())
    }

    /// Closes the segment and removes its backing file. Idempotent: a
    /// missing file is not an error.
    pub fn purge(&self) -> Result<()> {
        self.close()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.read()?;
        let opened = guard.as_ref().ok_or(Error::Closed)?;

        let entry = match find_block(&opened.index, key) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let block = read_block(&opened.file, entry, &self.path)?;
        Ok(block
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| block[i].1.clone()))
    }

    /// Ordered iterator over all entries. The iterator keeps its own file
    /// handle, so it stays valid if the segment is closed mid-iteration.
    pub fn iter(&self) -> Result<FileSegmentIterator> {
        let guard = self.inner.read()?;
        let opened = guard.as_ref().ok_or(Error::Closed)?;

        let blocks = opened
            .index
            .iter()
            .map(|e| (e.offset, e.size))
            .collect::<Vec<_>>();
        Ok(FileSegmentIterator {
            file: opened.file.try_clone()?,
            path: self.path.clone(),
            blocks,
            next_block: 0,
            current: Vec::new().into_iter(),
        })
    }
}

/// Rightmost index entry whose first key is <= the lookup key.
fn find_block<'a>(index: &'a [IndexEntry], key: &[u8]) -> Option<&'a IndexEntry> {
    let i = index.partition_point(|e| e.first_key.as_slice() <= key);
    if i == 0 {
        None
    } else {
        Some(&index[i - 1])
    }
}

fn read_block(file: &File, entry: &IndexEntry, path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut data = vec![0u8; entry.size as usize];
    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(entry.offset))?;
    reader.read_exact(&mut data)?;
    decode_block(&data, path)
}

fn decode_block(data: &[u8], path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if data.len() < 4 {
        return Err(Error::Corrupted(format!(
            "segment block too short in {}",
            path.display()
        )));
    }
    let (payload, crc_bytes) = data.split_at(data.len() - 4);
    let crc = u32::from_be_bytes(crc_bytes.try_into().expect("4-byte split"));
    if crc != CRC32.checksum(payload) {
        return Err(Error::Corrupted(format!(
            "segment block checksum mismatch in {}",
            path.display()
        )));
    }

    let mut entries = Vec::new();
    let mut cursor = Cursor::new(payload);
    while (cursor.position() as usize) < payload.len() {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let val_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut value = vec![0u8; val_len];
        cursor.read_exact(&mut value)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn decode_index(data: &[u8], path: &Path) -> Result<Vec<IndexEntry>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut index = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut first_key = vec![0u8; key_len];
        cursor.read_exact(&mut first_key)?;
        let offset = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        index.push(IndexEntry {
            first_key,
            offset,
            size,
        });
    }
    if (cursor.position() as usize) != data.len() {
        return Err(Error::Corrupted(format!(
            "trailing bytes after segment index in {}",
            path.display()
        )));
    }
    Ok(index)
}

pub struct FileSegmentIterator {
    file: File,
    path: PathBuf,
    blocks: Vec<(u64, u64)>,
    next_block: usize,
    current: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for FileSegmentIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }
            if self.next_block >= self.blocks.len() {
                return None;
            }
            let (offset, size) = self.blocks[self.next_block];
            self.next_block += 1;

            let entry = IndexEntry {
                first_key: Vec::new(),
                offset,
                size,
            };
            match read_block(&self.file, &entry, &self.path) {
                Ok(entries) => self.current = entries.into_iter(),
                Err(e) => {
                    self.next_block = self.blocks.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Builds a segment file from entries added in ascending key order.
pub struct FileSegmentWriter {
    file: File,
    path: PathBuf,
    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    index: Vec<IndexEntry>,
    offset: u64,
}

impl FileSegmentWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::create(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..4].copy_from_slice(&FILE_SEGMENT_MAGIC);
        header[4..6].copy_from_slice(&FILE_SEGMENT_VERSION.to_be_bytes());
        file.write_all(&header)?;

        Ok(Self {
            file,
            path,
            block: Vec::new(),
            block_first_key: None,
            last_key: Vec::new(),
            index: Vec::new(),
            offset: HEADER_SIZE,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.index.is_empty() || self.block_first_key.is_some() {
            if key <= self.last_key.as_slice() {
                return Err(Error::InvalidData(format!(
                    "out-of-order key added to segment {}",
                    self.path.display()
                )));
            }
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        self.block.write_u32::<BigEndian>(key.len() as u32)?;
        self.block.extend_from_slice(key);
        self.block.write_u32::<BigEndian>(value.len() as u32)?;
        self.block.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        if self.block.len() >= MAX_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let first_key = match self.block_first_key.take() {
            Some(key) => key,
            None => return Ok(()),
        };
        let crc = CRC32.checksum(&self.block);
        let size = (self.block.len() + 4) as u64;

        self.file.write_all(&self.block)?;
        self.file.write_u32::<BigEndian>(crc)?;
        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            size,
        });
        self.offset += size;
        self.block.clear();
        Ok(())
    }

    /// Writes the index and footer and syncs the file.
    pub fn finish(mut self) -> Result<()> {
        self.flush_block()?;

        let mut index_data = Vec::new();
        index_data.write_u32::<BigEndian>(self.index.len() as u32)?;
        for entry in &self.index {
            index_data.write_u32::<BigEndian>(entry.first_key.len() as u32)?;
            index_data.extend_from_slice(&entry.first_key);
            index_data.write_u64::<BigEndian>(entry.offset)?;
            index_data.write_u64::<BigEndian>(entry.size)?;
        }

        self.file.write_all(&index_data)?;
        self.file.write_u64::<BigEndian>(self.offset)?;
        self.file.write_u64::<BigEndian>(index_data.len() as u64)?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_segment(path: &Path, entries: &[(&[u8], &[u8])]) -> FileSegment {
        let mut writer = FileSegmentWriter::create(path).expect("create");
        for (key, value) in entries {
            writer.add(key, value).expect("add");
        }
        writer.finish().expect("finish");

        let segment = FileSegment::new("seg", path);
        segment.open().expect("open");
        segment
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");
        let segment = build_segment(&path, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);

        assert_eq!(segment.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(segment.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(segment.get(b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(segment.get(b"d").unwrap(), None);
        assert!(segment.has(b"b").unwrap());
        assert!(!segment.has(b"0").unwrap());
    }

    #[test]
    fn test_multi_block_iteration() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");

        // Values large enough to force several blocks.
        let value = vec![0x42u8; 1024];
        let mut writer = FileSegmentWriter::create(&path).expect("create");
        for i in 0u32..32 {
            writer.add(&i.to_be_bytes(), &value).expect("add");
        }
        writer.finish().expect("finish");

        let segment = FileSegment::new("seg", &path);
        segment.open().expect("open");

        let entries: Vec<_> = segment.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 32);
        for (i, (key, val)) in entries.iter().enumerate() {
            assert_eq!(key, &(i as u32).to_be_bytes().to_vec());
            assert_eq!(val, &value);
        }

        assert_eq!(segment.get(&7u32.to_be_bytes()).unwrap(), Some(value));
    }

    #[test]
    fn test_out_of_order_add_fails() {
        let dir = tempdir().expect("tempdir");
        let mut writer = FileSegmentWriter::create(dir.path().join("0001")).expect("create");
        writer.add(b"b", b"2").expect("add");
        assert!(matches!(
            writer.add(b"a", b"1"),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_closed_segment_rejects_reads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");
        let segment = build_segment(&path, &[(b"a", b"1")]);

        segment.close().expect("close");
        assert_eq!(segment.get(b"a"), Err(Error::Closed));

        segment.open().expect("reopen");
        assert_eq!(segment.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_purge_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");
        let segment = build_segment(&path, &[(b"a", b"1")]);

        segment.purge().expect("purge");
        assert!(!path.exists());
        segment.purge().expect("second purge");
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0001");
        std::fs::write(&path, b"XXXX0000000000000000000000").unwrap();

        let segment = FileSegment::new("seg", &path);
        assert!(matches!(
            segment.open(),
            Err(Error::SegmentTypeUnknown(_))
        ));
    }
}
