//! Write-ahead log backing a mutable segment.
//!
//! Every mutation to a mutable segment is appended here before it is applied
//! to the in-memory map, so the segment can be rebuilt after a restart by
//! replaying the log.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (8 bytes) |
//! +------------------+
//! | Entry 1          |
//! +------------------+
//! | Entry 2          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Entry Format
//!
//! ```text
//! +--------+-----------+-------+-----------+-------+-----------+
//! |flag:u8 |key_len:u32| key   |val_len:u32| value |crc32:u32  |
//! +--------+-----------+-------+-----------+-------+-----------+
//! ```
//!
//! - All multi-byte integers use big-endian encoding for portability
//! - `flag` is 1 for a put (value follows) and 0 for a tombstone (no value)
//! - CRC32 checksum covers the entry from the flag through the value
//!
//! Replay stops at a torn tail (partial final entry after a crash) but
//! surfaces checksum mismatches as corruption.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const WAL_MAGIC: [u8; 4] = *b"EWAL";
const WAL_VERSION: u16 = 1;
const HEADER_SIZE: usize = 8;

const FLAG_TOMBSTONE: u8 = 0;
const FLAG_PUT: u8 = 1;

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Opens the log at `path`, creating it with a fresh header if empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut header = [0u8; HEADER_SIZE];
            header[..4].copy_from_slice(&WAL_MAGIC);
            header[4..6].copy_from_slice(&WAL_VERSION.to_be_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE];
            file.read_exact(&mut header)?;
            if header[..4] != WAL_MAGIC {
                return Err(Error::InvalidData(format!(
                    "bad wal magic in {}",
                    path.display()
                )));
            }
            let version = u16::from_be_bytes([header[4], header[5]]);
            if version != WAL_VERSION {
                return Err(Error::InvalidData(format!(
                    "unsupported wal version {version} in {}",
                    path.display()
                )));
            }
        }

        // Appends go through a buffered clone positioned at the end.
        let mut write_half = file.try_clone()?;
        write_half.seek(SeekFrom::End(0))?;
        let writer = BufWriter::new(write_half);

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a put (`Some(value)`) or tombstone (`None`) record.
    pub fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + 4 + key.len() + 4 + value.map_or(0, |v| v.len()));
        match value {
            Some(value) => {
                buf.push(FLAG_PUT);
                buf.write_u32::<BigEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.write_u32::<BigEndian>(value.len() as u32)?;
                buf.extend_from_slice(value);
            }
            None => {
                buf.push(FLAG_TOMBSTONE);
                buf.write_u32::<BigEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
            }
        }
        let crc = CRC32.checksum(&buf);

        let mut writer = self.writer.lock()?;
        writer.write_all(&buf)?;
        writer.write_u32::<BigEndian>(crc)?;
        Ok(())
    }

    /// Flushes buffered appends and syncs the file to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Returns an iterator replaying every record in append order.
    pub fn replay(&self) -> Result<ReplayIterator> {
        self.writer.lock()?.flush()?;
        let mut file = File::open(&self.path)?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        Ok(ReplayIterator {
            reader: BufReader::new(file),
            path: self.path.clone(),
            done: false,
        })
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl ReplayIterator {
    fn read_entry(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        let flag = match self.reader.read_u8() {
            Ok(flag) => flag,
            // Clean end of log.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if flag != FLAG_PUT && flag != FLAG_TOMBSTONE {
            return Err(Error::Corrupted(format!(
                "bad wal record flag {flag} in {}",
                self.path.display()
            )));
        }

        let (body, key, value, crc) = match self.read_record_body(flag) {
            Ok(parts) => parts,
            // A partial entry here is a torn tail from a crash; treat it as
            // the end of the log.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %self.path.display(), "Torn wal tail, stopping replay");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if crc != CRC32.checksum(&body) {
            return Err(Error::Corrupted(format!(
                "wal checksum mismatch in {}",
                self.path.display()
            )));
        }

        Ok(Some((key, value)))
    }

    #[allow(clippy::type_complexity)]
    fn read_record_body(
        &mut self,
        flag: u8,
    ) -> std::io::Result<(Vec<u8>, Vec<u8>, Option<Vec<u8>>, u32)> {
        let mut body = vec![flag];

        let key_len = self.reader.read_u32::<BigEndian>()?;
        body.extend_from_slice(&key_len.to_be_bytes());
        let mut key = vec![0u8; key_len as usize];
        self.reader.read_exact(&mut key)?;
        body.extend_from_slice(&key);

        let value = if flag == FLAG_PUT {
            let val_len = self.reader.read_u32::<BigEndian>()?;
            body.extend_from_slice(&val_len.to_be_bytes());
            let mut value = vec![0u8; val_len as usize];
            self.reader.read_exact(&mut value)?;
            body.extend_from_slice(&value);
            Some(value)
        } else {
            None
        };

        let crc = self.reader.read_u32::<BigEndian>()?;
        Ok((body, key, value, crc))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().expect("tempdir");
        let wal = Wal::open(dir.path().join("segment.wal")).expect("open");

        wal.append(b"key1", Some(b"value1")).expect("append");
        wal.append(b"key2", Some(b"value2")).expect("append");
        wal.append(b"key1", None).expect("append tombstone");
        wal.sync().expect("sync");

        let entries: Vec<_> = wal.replay().expect("replay").map(|e| e.unwrap()).collect();
        assert_eq!(
            entries,
            vec![
                (b"key1".to_vec(), Some(b"value1".to_vec())),
                (b"key2".to_vec(), Some(b"value2".to_vec())),
                (b"key1".to_vec(), None),
            ]
        );
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("segment.wal");

        {
            let wal = Wal::open(&path).expect("open");
            wal.append(b"a", Some(b"1")).expect("append");
            wal.sync().expect("sync");
        }
        {
            let wal = Wal::open(&path).expect("reopen");
            wal.append(b"b", Some(b"2")).expect("append");
            wal.sync().expect("sync");

            let entries: Vec<_> = wal.replay().expect("replay").map(|e| e.unwrap()).collect();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[1], (b"b".to_vec(), Some(b"2".to_vec())));
        }
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("segment.wal");

        {
            let wal = Wal::open(&path).expect("open");
            wal.append(b"a", Some(b"1")).expect("append");
            wal.sync().expect("sync");
        }

        // Truncate into the middle of a hand-appended second record.
        {
            use std::io::Write;
            let mut file = File::options().append(true).open(&path).unwrap();
            file.write_all(&[FLAG_PUT, 0, 0, 0, 4, b'k']).unwrap();
        }

        let wal = Wal::open(&path).expect("reopen");
        let entries: Vec<_> = wal.replay().expect("replay").map(|e| e.unwrap()).collect();
        assert_eq!(entries, vec![(b"a".to_vec(), Some(b"1".to_vec()))]);
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("segment.wal");
        std::fs::write(&path, b"not a wal").unwrap();

        assert!(matches!(Wal::open(&path), Err(Error::InvalidData(_))));
    }
}
