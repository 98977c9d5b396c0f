//! Redo journal of committed writes to the durable store.
//!
//! Every commit that changed a row appends one entry holding the full new
//! version of each written row. Opening the store replays the journal in
//! order, so the last entry for a key wins.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|
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
//! +-----------+------------------------+-----------+
//! |  len:u32  | payload: bincode batch | crc32:u32 |
//! +-----------+------------------------+-----------+
//! ```
//!
//! The checksum covers the payload. A process killed mid-append leaves a
//! short last entry; replay drops it and truncates the file back to the last
//! whole entry. A checksum mismatch in a whole entry is corruption and fails
//! the open.

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const HEADER_SIZE: usize = 16;
const MAGIC: &[u8; 8] = b"KNNB\x00JRN";
const VERSION: u32 = 1;

/// Durable relation a journaled row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    Queries,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalOp {
    pub relation: Relation,
    pub key: Vec<u8>,
    pub row: Vec<u8>,
}

/// Writes of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalBatch {
    pub txn: u64,
    pub ops: Vec<JournalOp>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    magic: [u8; 8],
    version: u32,
}

impl Header {
    fn new() -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let version = (&buf[8..12])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("version", e))?;
        Ok(Header { magic, version })
    }

    fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidHeader);
        }
        if self.version != VERSION {
            return Err(Error::CorruptedJournal(format!(
                "unsupported journal version {}",
                self.version
            )));
        }
        Ok(())
    }
}

pub struct Journal {
    file: File,
    path: PathBuf,
    sync: bool,
    entries: u64,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("sync", &self.sync)
            .field("entries", &self.entries)
            .finish()
    }
}

impl Journal {
    /// Opens or creates the journal at `path` and returns the batches it
    /// holds, oldest first.
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Vec<JournalBatch>)> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let batches = if file.metadata()?.len() == 0 {
            file.write_all(&Header::new().encode())?;
            file.sync_all()?;
            Vec::new()
        } else {
            let (batches, good_len) = Self::replay(&mut file)?;
            if good_len < file.metadata()?.len() {
                tracing::warn!(
                    path = %path.display(),
                    offset = good_len,
                    "Dropping torn entry at the end of the journal"
                );
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            batches
        };

        tracing::debug!(path = %path.display(), entries = batches.len(), "Opened journal");

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                sync,
                entries: batches.len() as u64,
            },
            batches,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended since the file was created.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn append(&mut self, batch: &JournalBatch) -> Result<()> {
        let payload = crate::encoding::bincode::serialize(batch);
        let checksum = CRC32.checksum(&payload);

        let mut entry = Vec::with_capacity(payload.len() + 8);
        entry.write_u32::<BigEndian>(payload.len() as u32)?;
        entry.extend_from_slice(&payload);
        entry.write_u32::<BigEndian>(checksum)?;

        self.file.write_all(&entry)?;
        if self.sync {
            self.file.sync_data()?;
        }
        self.entries += 1;
        Ok(())
    }

    /// Reads every whole entry. Returns the batches and the length of the
    /// valid prefix of the file.
    fn replay(file: &mut File) -> Result<(Vec<JournalBatch>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);

        let mut buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::Decode("journal header", e))?;
        Header::decode(&buf)?.validate()?;

        let mut batches = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        while let Some((batch, len)) = Self::read_entry(&mut reader)? {
            batches.push(batch);
            offset += len;
        }
        Ok((batches, offset))
    }

    /// `None` at the end of the file or at a torn entry.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(JournalBatch, u64)>> {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = Vec::new();
        reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
        if payload.len() < len {
            return Ok(None);
        }

        let stored = match reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if CRC32.checksum(&payload) != stored {
            return Err(Error::CorruptedJournal("checksum mismatch".to_string()));
        }

        let batch = crate::encoding::bincode::deserialize(&payload)
            .map_err(|e| Error::CorruptedJournal(e.to_string()))?;
        Ok(Some((batch, len as u64 + 8)))
    }
}
