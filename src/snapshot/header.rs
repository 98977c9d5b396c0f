use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

// 4 + 4 + 8 bytes
pub const HEADER_SIZE: usize = 16;

/// Identifies a knowledge-base snapshot file.
pub const FILE_MAGIC: u32 = 123467589;
/// Bumped whenever a record layout changes. Files of another version are
/// discarded, never migrated.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub record_count: i64,
}

impl Header {
    pub fn new(record_count: i64) -> Self {
        Header {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            record_count,
        }
    }

    /// Whether this header was written by the current format.
    pub fn is_current(&self) -> bool {
        self.magic == FILE_MAGIC && self.version == FORMAT_VERSION && self.record_count >= 0
    }
}

impl TryInto<Vec<u8>> for &Header {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        HeaderEncoder::new(&mut buf).encode(self)?;
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        HeaderDecoder::new(bytes).decode()
    }
}

pub struct HeaderDecoder<R: Read> {
    reader: R,
}

impl<R: Read> HeaderDecoder<R> {
    pub fn new(reader: R) -> Self {
        HeaderDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<Header> {
        let magic = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("magic", e))?;

        let version = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("version", e))?;

        let record_count = self
            .reader
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("record_count", e))?;

        Ok(Header {
            magic,
            version,
            record_count,
        })
    }
}

pub struct HeaderEncoder<W: Write> {
    writer: W,
}

impl<W: Write> HeaderEncoder<W> {
    pub fn new(writer: W) -> Self {
        HeaderEncoder { writer }
    }

    pub fn encode(&mut self, header: &Header) -> Result<()> {
        self.writer
            .write_u32::<BigEndian>(header.magic)
            .map_err(|e| Error::Encode("magic", e))?;

        self.writer
            .write_u32::<BigEndian>(header.version)
            .map_err(|e| Error::Encode("version", e))?;

        self.writer
            .write_i64::<BigEndian>(header.record_count)
            .map_err(|e| Error::Encode("record_count", e))?;

        Ok(())
    }
}
