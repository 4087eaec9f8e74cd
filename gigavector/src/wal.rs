//! Write-ahead log: append-only record stream with a versioned header.
//!
//! A new file always writes the current version (3). An opened file may be
//! v1 (insert-only, no per-record CRC, no index-type word), v2 (adds CRC),
//! or v3 (adds the index-type word plus DELETE/UPDATE record kinds).
//! Mixing is not allowed: writing a DELETE/UPDATE record to an opened v1/v2
//! file is rejected rather than silently upgrading the file in place.

use crate::vector::Metadata;
use crate::{Error, Result, VectorId};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"GVW1";
pub const CURRENT_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Insert {
        id: VectorId,
        data: Vec<f32>,
        metadata: Metadata,
    },
    Delete {
        id: VectorId,
    },
    Update {
        id: VectorId,
        data: Vec<f32>,
        metadata: Metadata,
    },
}

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::Insert { .. } => 1,
            WalRecord::Delete { .. } => 2,
            WalRecord::Update { .. } => 3,
        }
    }
}

/// An open write-ahead log file: header already validated, positioned for
/// appends or replay.
pub struct WriteAheadLog {
    file: File,
    version: u32,
    dim: u32,
    index_type: Option<u32>,
}

impl WriteAheadLog {
    /// Open an existing WAL at `path`, or create one with the current
    /// header if none exists. `dim` and `index_type` are validated against
    /// an existing file's header.
    pub fn open(path: impl AsRef<Path>, dim: u32, index_type: u32) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open_existing(path, dim, index_type)
        } else {
            Self::create(path, dim, index_type)
        }
    }

    fn create(path: &Path, dim: u32, index_type: u32) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).read(true).open(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&CURRENT_VERSION.to_le_bytes())?;
        file.write_all(&dim.to_le_bytes())?;
        file.write_all(&index_type.to_le_bytes())?;
        file.flush()?;
        Ok(Self {
            file,
            version: CURRENT_VERSION,
            dim,
            index_type: Some(index_type),
        })
    }

    fn open_existing(path: &Path, expected_dim: u32, expected_index_type: u32) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::CorruptWal("bad magic in WAL header".into()));
        }
        let version = read_u32(&mut file)?;
        let dim = read_u32(&mut file)?;
        if dim != expected_dim {
            return Err(Error::CorruptWal(format!(
                "WAL dim {dim} does not match database dim {expected_dim}"
            )));
        }
        let index_type = if version >= 2 {
            let it = read_u32(&mut file)?;
            if version >= 3 && it != expected_index_type {
                return Err(Error::CorruptWal(format!(
                    "WAL index_type {it} does not match database index_type {expected_index_type}"
                )));
            }
            Some(it)
        } else {
            None
        };

        Ok(Self {
            file,
            version,
            dim,
            index_type,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Append one record. Rejects DELETE/UPDATE under an opened v1/v2 file
    /// rather than silently treating it as an upgrade.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        if self.version < 3 && !matches!(record, WalRecord::Insert { .. }) {
            return Err(Error::CorruptWal(
                "DELETE/UPDATE records require a v3 write-ahead log".into(),
            ));
        }

        let mut body = Vec::new();
        body.push(record.kind());
        match record {
            WalRecord::Insert { id, data, metadata } | WalRecord::Update { id, data, metadata } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&(data.len() as u32).to_le_bytes());
                for x in data {
                    body.extend_from_slice(&x.to_le_bytes());
                }
                write_metadata(&mut body, metadata);
            }
            WalRecord::Delete { id } => {
                body.extend_from_slice(&id.to_le_bytes());
            }
        }

        self.file.write_all(&body)?;
        if self.version >= 2 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&body);
            self.file.write_all(&hasher.finalize().to_le_bytes())?;
        }
        self.file.flush()?;
        Ok(())
    }

    /// Replay every record from just after the header to EOF, invoking
    /// `apply` for each. Stops and returns an error on CRC mismatch or a
    /// short/torn trailing record, leaving the caller to decide whether to
    /// truncate.
    pub fn replay(&mut self, mut apply: impl FnMut(WalRecord) -> Result<()>) -> Result<()> {
        tracing::debug!(version = self.version, "wal replay starting");
        let header_len = if self.version >= 2 { 16 } else { 12 };
        self.file.seek(SeekFrom::Start(header_len))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut replayed = 0u64;

        loop {
            let mut kind_buf = [0u8; 1];
            match reader.read_exact(&mut kind_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            }
            let kind = kind_buf[0];

            let mut body = vec![kind];
            let id = read_u64_from(&mut reader)?;
            body.extend_from_slice(&id.to_le_bytes());

            let record = match kind {
                1 | 3 => {
                    let dim = read_u32_from(&mut reader)?;
                    body.extend_from_slice(&dim.to_le_bytes());
                    let mut data = Vec::with_capacity(dim as usize);
                    for _ in 0..dim {
                        let mut buf = [0u8; 4];
                        reader
                            .read_exact(&mut buf)
                            .map_err(|_| Error::CorruptWal("truncated WAL record payload".into()))?;
                        body.extend_from_slice(&buf);
                        data.push(f32::from_le_bytes(buf));
                    }
                    let metadata = read_metadata(&mut reader, &mut body)?;
                    if kind == 1 {
                        WalRecord::Insert { id, data, metadata }
                    } else {
                        WalRecord::Update { id, data, metadata }
                    }
                }
                2 => WalRecord::Delete { id },
                other => return Err(Error::CorruptWal(format!("unknown WAL record kind {other}"))),
            };

            if self.version >= 2 {
                let mut crc_buf = [0u8; 4];
                reader
                    .read_exact(&mut crc_buf)
                    .map_err(|_| Error::CorruptWal("truncated WAL record CRC".into()))?;
                let expected = u32::from_le_bytes(crc_buf);
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&body);
                let actual = hasher.finalize();
                if actual != expected {
                    tracing::warn!(record = replayed, expected, actual, "wal record crc mismatch");
                    return Err(Error::CorruptWal("WAL record CRC mismatch".into()));
                }
            }

            apply(record)?;
            replayed += 1;
        }
        tracing::debug!(replayed, "wal replay finished");
        Ok(())
    }

    /// Truncate to an empty file and write a fresh current-version header,
    /// called after a successful checkpoint.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(MAGIC)?;
        self.file.write_all(&CURRENT_VERSION.to_le_bytes())?;
        self.file.write_all(&self.dim.to_le_bytes())?;
        let index_type = self.index_type.unwrap_or(0);
        self.file.write_all(&index_type.to_le_bytes())?;
        self.file.flush()?;
        self.version = CURRENT_VERSION;
        self.index_type = Some(index_type);
        tracing::debug!("wal reset after checkpoint");
        Ok(())
    }
}

fn write_metadata(out: &mut Vec<u8>, metadata: &Metadata) {
    out.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    for (k, v) in metadata.iter() {
        out.extend_from_slice(&(k.len() as u32).to_le_bytes());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        out.extend_from_slice(v.as_bytes());
    }
}

fn read_metadata(reader: &mut impl Read, body: &mut Vec<u8>) -> Result<Metadata> {
    let count = read_u32_from(reader)?;
    body.extend_from_slice(&count.to_le_bytes());
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let klen = read_u32_from(reader)?;
        body.extend_from_slice(&klen.to_le_bytes());
        let key = read_string(reader, klen as usize, body)?;
        let vlen = read_u32_from(reader)?;
        body.extend_from_slice(&vlen.to_le_bytes());
        let value = read_string(reader, vlen as usize, body)?;
        metadata.set(key, value);
    }
    Ok(metadata)
}

fn read_string(reader: &mut impl Read, len: usize, body: &mut Vec<u8>) -> Result<String> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::CorruptWal("truncated WAL metadata string".into()))?;
    body.extend_from_slice(&buf);
    String::from_utf8(buf).map_err(|_| Error::CorruptWal("non-UTF8 WAL metadata string".into()))
}

fn read_u32(file: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32_from(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::CorruptWal("truncated WAL record".into()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_from(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::CorruptWal("truncated WAL record".into()))?;
    Ok(u64::from_le_bytes(buf))
}

/// Buffered sequential writer kept separate from [`WriteAheadLog`] so the
/// snapshot writer in `db.rs` can share the same length-prefixed primitives
/// without pulling in WAL-specific header logic.
pub fn write_buffered(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_reads_back_the_same_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            WriteAheadLog::open(&path, 4, 1).unwrap();
        }
        let wal = WriteAheadLog::open(&path, 4, 1).unwrap();
        assert_eq!(wal.version(), CURRENT_VERSION);
    }

    #[test]
    fn open_with_mismatched_dim_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        WriteAheadLog::open(&path, 4, 1).unwrap();
        let err = WriteAheadLog::open(&path, 8, 1).unwrap_err();
        assert!(matches!(err, Error::CorruptWal(_)));
    }

    #[test]
    fn append_and_replay_round_trips_insert_delete_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::open(&path, 2, 1).unwrap();

        let mut meta = Metadata::new();
        meta.set("tag", "x");
        wal.append(&WalRecord::Insert {
            id: 0,
            data: vec![1.0, 2.0],
            metadata: meta.clone(),
        })
        .unwrap();
        wal.append(&WalRecord::Update {
            id: 0,
            data: vec![3.0, 4.0],
            metadata: meta,
        })
        .unwrap();
        wal.append(&WalRecord::Delete { id: 0 }).unwrap();

        let mut replayed = Vec::new();
        wal.replay(|record| {
            replayed.push(record);
            Ok(())
        })
        .unwrap();

        assert_eq!(replayed.len(), 3);
        assert!(matches!(replayed[0], WalRecord::Insert { id: 0, .. }));
        assert!(matches!(replayed[1], WalRecord::Update { id: 0, .. }));
        assert!(matches!(replayed[2], WalRecord::Delete { id: 0 }));
    }

    #[test]
    fn corrupted_record_crc_fails_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(&path, 1, 1).unwrap();
            wal.append(&WalRecord::Insert {
                id: 0,
                data: vec![1.0],
                metadata: Metadata::new(),
            })
            .unwrap();
        }

        // Flip the last byte (part of the trailing CRC) to corrupt it.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut wal = WriteAheadLog::open(&path, 1, 1).unwrap();
        let err = wal.replay(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::CorruptWal(_)));
    }

    #[test]
    fn reset_truncates_and_rewrites_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::open(&path, 1, 1).unwrap();
        wal.append(&WalRecord::Insert {
            id: 0,
            data: vec![1.0],
            metadata: Metadata::new(),
        })
        .unwrap();
        wal.reset().unwrap();

        let mut seen = 0;
        wal.replay(|_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn v1_header_rejects_delete_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v1.wal");
        {
            // Hand-write a v1 header (no CRC, no index-type).
            let mut file = OpenOptions::new().create(true).write(true).open(&path).unwrap();
            file.write_all(MAGIC).unwrap();
            file.write_all(&1u32.to_le_bytes()).unwrap();
            file.write_all(&2u32.to_le_bytes()).unwrap();
        }
        let mut wal = WriteAheadLog::open(&path, 2, 1).unwrap();
        assert_eq!(wal.version(), 1);
        let err = wal.append(&WalRecord::Delete { id: 0 }).unwrap_err();
        assert!(matches!(err, Error::CorruptWal(_)));
    }
}
