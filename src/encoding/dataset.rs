//! Flat byte layout of a dataset chunk in the shared cache.
//!
//! # Chunk Format
//!
//! ```text
//! +--------+---------+------------------------+--------------+-----------------+--------------+
//! | fs:u64 | fss:i32 | matrix: rows*cols f64  | targets: f64 | reliability:f64 | rel ids: u32 |
//! +--------+---------+------------------------+--------------+-----------------+--------------+
//! | 8 bytes| 4 bytes | row-major              | rows values  | rows values     | nrels values |
//! +--------+---------+------------------------+--------------+-----------------+--------------+
//! ```
//!
//! The key at the front is only a consistency aid: the index entry that owns
//! the chunk already knows it. `cols`, `rows` and `nrels` are not stored in
//! the chunk either; the index entry keeps them and passes them to the
//! decoder, which insists that they account for every byte of the chunk.
//!
//! # Record Format
//!
//! Snapshot files need the shape as well, so a record is the chunk prefixed
//! by `cols:i32 | rows:i32 | nrels:i32`.
//!
//! All values are big-endian.

use super::EncodingError;
use crate::error::Result;
use crate::types::{FeatureSubspaceKey, OkNNDataset, RelationId};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const CHUNK_HEADER_SIZE: usize = 12;
pub const RECORD_HEADER_SIZE: usize = 12;

/// Shape of a stored dataset, as kept by the index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub cols: i32,
    pub rows: i32,
    pub nrels: i32,
}

impl Shape {
    pub fn of(data: &OkNNDataset, relations: &[RelationId]) -> Self {
        Self {
            cols: data.cols,
            rows: data.rows,
            nrels: relations.len() as i32,
        }
    }

    /// Exact chunk size for this shape. Fails for a shape whose size does
    /// not fit in `usize`.
    pub fn chunk_size(&self) -> Result<usize> {
        let cols = self.cols.max(0) as usize;
        let rows = self.rows.max(0) as usize;
        let nrels = self.nrels.max(0) as usize;

        rows.checked_mul(cols)
            .and_then(|cells| cells.checked_add(rows.checked_mul(2)?))
            .and_then(|values| values.checked_mul(8))
            .and_then(|bytes| bytes.checked_add(nrels.checked_mul(4)?))
            .and_then(|bytes| bytes.checked_add(CHUNK_HEADER_SIZE))
            .ok_or_else(|| {
                EncodingError::InvalidFormat(format!("Oversized shape {:?}", self)).into()
            })
    }
}

/// Writes a dataset into a chunk that was sized with [`Shape::chunk_size`].
pub fn write_chunk(
    chunk: &mut [u8],
    key: &FeatureSubspaceKey,
    data: &OkNNDataset,
    relations: &[RelationId],
) -> Result<()> {
    let expected = Shape::of(data, relations).chunk_size()?;
    if chunk.len() != expected {
        return Err(EncodingError::LengthMismatch {
            expected,
            actual: chunk.len(),
        }
        .into());
    }
    if !data.is_consistent() {
        return Err(EncodingError::InvalidFormat(format!(
            "Dataset for {} disagrees with its own shape",
            key
        ))
        .into());
    }

    let mut cursor = Cursor::new(chunk);
    encode_body(&mut cursor, key, data, relations).map_err(|e| crate::Error::Encode("chunk", e))
}

fn encode_body<W: Write>(
    writer: &mut W,
    key: &FeatureSubspaceKey,
    data: &OkNNDataset,
    relations: &[RelationId],
) -> std::io::Result<()> {
    writer.write_u64::<BigEndian>(key.fs)?;
    writer.write_i32::<BigEndian>(key.fss)?;
    for value in data
        .matrix
        .iter()
        .chain(&data.targets)
        .chain(&data.reliability)
    {
        writer.write_f64::<BigEndian>(*value)?;
    }
    for rel in relations {
        writer.write_u32::<BigEndian>(*rel)?;
    }
    Ok(())
}

/// Reads a chunk back, checking the embedded key and the total length.
pub fn read_chunk(
    chunk: &[u8],
    key: &FeatureSubspaceKey,
    shape: Shape,
) -> Result<(OkNNDataset, Vec<RelationId>)> {
    let expected = shape.chunk_size()?;
    if chunk.len() != expected {
        return Err(EncodingError::LengthMismatch {
            expected,
            actual: chunk.len(),
        }
        .into());
    }

    let mut cursor = Cursor::new(chunk);
    let stored = FeatureSubspaceKey {
        fs: cursor
            .read_u64::<BigEndian>()
            .map_err(|e| crate::Error::Decode("fs", e))?,
        fss: cursor
            .read_i32::<BigEndian>()
            .map_err(|e| crate::Error::Decode("fss", e))?,
    };
    if stored != *key {
        return Err(crate::Error::HashTableCorrupted(format!(
            "chunk for {} holds data of {}",
            key, stored
        )));
    }

    let (data, relations) =
        decode_body(&mut cursor, shape).map_err(|e| crate::Error::Decode("chunk", e))?;
    Ok((data, relations))
}

fn decode_body<R: Read>(
    reader: &mut R,
    shape: Shape,
) -> std::io::Result<(OkNNDataset, Vec<RelationId>)> {
    let cols = shape.cols.max(0) as usize;
    let rows = shape.rows.max(0) as usize;

    let mut read_vec = |n: usize| -> std::io::Result<Vec<f64>> {
        let mut values = vec![0f64; n];
        reader.read_f64_into::<BigEndian>(&mut values)?;
        Ok(values)
    };
    let matrix = read_vec(rows * cols)?;
    let targets = read_vec(rows)?;
    let reliability = read_vec(rows)?;

    let mut relations = vec![0u32; shape.nrels.max(0) as usize];
    reader.read_u32_into::<BigEndian>(&mut relations)?;

    Ok((
        OkNNDataset {
            cols: shape.cols,
            rows: shape.rows,
            matrix,
            targets,
            reliability,
        },
        relations,
    ))
}

/// Encodes a snapshot record: shape header followed by the chunk.
pub fn encode_record(
    key: &FeatureSubspaceKey,
    data: &OkNNDataset,
    relations: &[RelationId],
) -> Result<Vec<u8>> {
    let shape = Shape::of(data, relations);
    let mut record = vec![0u8; RECORD_HEADER_SIZE + shape.chunk_size()?];
    BigEndian::write_i32(&mut record[0..4], shape.cols);
    BigEndian::write_i32(&mut record[4..8], shape.rows);
    BigEndian::write_i32(&mut record[8..12], shape.nrels);
    write_chunk(&mut record[RECORD_HEADER_SIZE..], key, data, relations)?;
    Ok(record)
}

/// Decodes a snapshot record produced by [`encode_record`].
pub fn decode_record(
    record: &[u8],
) -> Result<(FeatureSubspaceKey, OkNNDataset, Vec<RelationId>)> {
    if record.len() < RECORD_HEADER_SIZE + CHUNK_HEADER_SIZE {
        return Err(EncodingError::TruncatedData.into());
    }

    let shape = Shape {
        cols: BigEndian::read_i32(&record[0..4]),
        rows: BigEndian::read_i32(&record[4..8]),
        nrels: BigEndian::read_i32(&record[8..12]),
    };
    if shape.cols < 0 || shape.rows < 0 || shape.nrels < 0 {
        return Err(EncodingError::InvalidFormat(format!("Negative shape {:?}", shape)).into());
    }

    let chunk = &record[RECORD_HEADER_SIZE..];
    let key = FeatureSubspaceKey {
        fs: BigEndian::read_u64(&chunk[0..8]),
        fss: BigEndian::read_i32(&chunk[8..12]),
    };
    let (data, relations) = read_chunk(chunk, &key, shape)?;
    Ok((key, data, relations))
}
