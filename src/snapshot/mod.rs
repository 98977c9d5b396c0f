//! One-shot snapshot files for the shared tables.
//!
//! On shutdown each shared table is written to its own snapshot file; on the
//! next startup the file is read back into the fresh table and deleted. The
//! file is a handoff between two runs, not a durable log: the in-memory table
//! is authoritative and a snapshot that cannot be written or read is logged
//! and dropped.
//!
//! # File Format
//!
//! ```text
//! +---------------------------+
//! | Header (16 bytes)         |
//! |  magic:u32                |
//! |  version:u32              |
//! |  record_count:i64         |
//! +---------------------------+
//! | size:u64 | payload        |  record 1
//! +---------------------------+
//! | size:u64 | payload        |  record 2
//! +---------------------------+
//! | ...                       |
//! +---------------------------+
//! ```
//!
//! The payload is opaque here; each table owns its record encoding.
//!
//! # Crash Safety
//!
//! Records go to `<file>.tmp`, which is synced and then renamed over the
//! target, followed by a sync of the directory. A crash at any point leaves
//! either the previous snapshot or the new one, never a torn file.

pub mod header;

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use header::{Header, HeaderEncoder, HEADER_SIZE};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Writes `records` to `path`, replacing any previous snapshot.
///
/// Returns the number of records written, or `None` if the snapshot could not
/// be written. Failures are logged and the temporary file is removed; the
/// previous snapshot, if any, is left untouched.
pub fn store<R: AsRef<[u8]>>(path: &Path, records: &[R]) -> Option<usize> {
    let tmp = tmp_path(path);

    match write_records(&tmp, records).and_then(|_| durable_rename(&tmp, path)) {
        Ok(()) => {
            tracing::debug!(
                path = %path.display(),
                records = records.len(),
                "Stored snapshot"
            );
            Some(records.len())
        }
        Err(e) => {
            tracing::warn!(path = %tmp.display(), error = %e, "Could not write snapshot file");
            let _ = fs::remove_file(&tmp);
            None
        }
    }
}

fn write_records<R: AsRef<[u8]>>(tmp: &Path, records: &[R]) -> Result<()> {
    let file = File::create(tmp)?;
    let mut writer = BufWriter::new(file);

    HeaderEncoder::new(&mut writer).encode(&Header::new(records.len() as i64))?;

    for record in records {
        let payload = record.as_ref();
        writer.write_u64::<BigEndian>(payload.len() as u64)?;
        writer.write_all(payload)?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| Error::IoError(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn durable_rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;

    #[cfg(unix)]
    if let Some(dir) = to.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }

    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Reads the snapshot at `path`, calling `apply` with each record payload.
///
/// A missing file is a first start and yields `Ok(0)`. A file with a foreign
/// magic number or format version, or one that cannot be read to the end, is
/// logged and discarded as a whole: every record is read before the first one
/// is applied. Errors returned by `apply` abort the load and are propagated.
/// The file is deleted in every case: a snapshot is consumed at most once.
pub fn load<F>(path: &Path, mut apply: F) -> Result<usize>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read snapshot file");
            return Ok(0);
        }
    };

    let result = read_records(file);
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove snapshot file");
    }

    let records = match result {
        Ok(Some(records)) => records,
        Ok(None) => {
            tracing::warn!(path = %path.display(), "Ignoring invalid data in snapshot file");
            return Ok(0);
        }
        Err(Error::IoError(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read snapshot file");
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    for payload in &records {
        apply(payload)?;
    }
    tracing::debug!(path = %path.display(), records = records.len(), "Loaded snapshot");
    Ok(records.len())
}

/// `Ok(None)` means the header does not belong to this format.
fn read_records(file: File) -> Result<Option<Vec<Vec<u8>>>> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    let header = Header::try_from(&buf[..])?;
    if !header.is_current() {
        return Ok(None);
    }

    let mut records = Vec::new();
    let mut consumed = HEADER_SIZE as u64;
    for _ in 0..header.record_count {
        let size = reader.read_u64::<BigEndian>()?;
        consumed += 8;

        // Never trust a size that runs past the end of the file
        if size > file_len.saturating_sub(consumed) {
            return Err(Error::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record of {} bytes runs past end of file", size),
            )));
        }

        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload)?;
        consumed += size;
        records.push(payload);
    }

    Ok(Some(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collect(path: &Path) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        load(path, |payload| {
            out.push(payload.to_vec());
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.stat");

        let records = vec![b"first".to_vec(), Vec::new(), b"third record".to_vec()];
        assert_eq!(store(&path, &records), Some(3));
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());

        assert_eq!(collect(&path).unwrap(), records);
        assert!(!path.exists(), "Snapshot must be consumed by load");
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layout.stat");
        store(&path, &[b"ab".to_vec()]).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 8 + 2);
        assert_eq!(&bytes[0..4], &header::FILE_MAGIC.to_be_bytes());
        assert_eq!(&bytes[4..8], &header::FORMAT_VERSION.to_be_bytes());
        assert_eq!(&bytes[8..16], &1i64.to_be_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_be_bytes());
        assert_eq!(&bytes[24..], b"ab");
    }

    #[test]
    fn test_missing_file_is_first_start() {
        let dir = tempdir().unwrap();
        let loaded = load(&dir.path().join("absent.stat"), |_| {
            panic!("No records expected")
        })
        .unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn test_foreign_version_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.stat");
        store(&path, &[b"payload".to_vec()]).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&(header::FORMAT_VERSION + 1).to_be_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(collect(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_truncated_file_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.stat");
        store(&path, &[vec![7u8; 64], vec![8u8; 64]]).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let mut seen = 0;
        let loaded = load(&path, |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(loaded, 0);
        // The intact first record is not applied either
        assert_eq!(seen, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_callback_error_propagates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.stat");
        store(&path, &[b"x".to_vec()]).unwrap();

        let result = load(&path, |payload| {
            Err(Error::SizeMismatch {
                expected: 8,
                actual: payload.len(),
            })
        });
        assert!(matches!(result, Err(Error::SizeMismatch { actual: 1, .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_store_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keep.stat");
        store(&path, &[b"old".to_vec()]).unwrap();

        // A directory squatting on the temp name makes the write fail
        fs::create_dir(tmp_path(&path)).unwrap();
        assert_eq!(store(&path, &[b"new".to_vec()]), None);

        fs::remove_dir(tmp_path(&path)).unwrap();
        assert_eq!(collect(&path).unwrap(), vec![b"old".to_vec()]);
    }
}
