//! Registry of query texts, one per query class.
//!
//! The text itself lives in an arena chunk, NUL terminated; the index keeps
//! the chunk handle. The first text stored for an id is authoritative.
//!
//! Snapshot records are `query_id:u64 (big-endian) | text bytes | 0x00`.

use crate::arena::{Arena, ChunkAllocator, Handle};
use crate::error::Result;
use crate::snapshot;
use crate::Error;

use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Query id of the common feature space. Its text survives a reset.
pub const DEFAULT_QUERY_ID: u64 = 0;
pub const DEFAULT_QUERY_TEXT: &str = "COMMON feature space (do not delete!)";

pub struct QueryTexts {
    arena: Arc<Arena>,
    entries: RwLock<HashMap<u64, Handle>>,
    // Set under the write lock, cleared under the read lock by flush
    changed: AtomicBool,
    path: PathBuf,
}

impl std::fmt::Debug for QueryTexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTexts")
            .field("entries", &self.entries.read().len())
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .field("path", &self.path)
            .finish()
    }
}

impl QueryTexts {
    pub fn new(arena: Arc<Arena>, path: impl Into<PathBuf>) -> Self {
        Self {
            arena,
            entries: RwLock::new(HashMap::new()),
            changed: AtomicBool::new(false),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the registry differs from its last snapshot.
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Stores `text` for `query_id` unless a text is already there. Returns
    /// whether this call stored it. A text holding a NUL byte is refused, as
    /// the terminator would cut it short.
    pub fn store_text(&self, query_id: u64, text: &str) -> Result<bool> {
        if text.contains('\0') {
            return Err(Error::InvalidData(format!(
                "text of query {} contains a NUL byte",
                query_id
            )));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&query_id) {
            return Ok(false);
        }

        let handle = self.copy_in(text.as_bytes())?;
        entries.insert(query_id, handle);
        self.changed.store(true, Ordering::Release);
        Ok(true)
    }

    fn copy_in(&self, text: &[u8]) -> Result<Handle> {
        let handle = self.arena.allocate(text.len() + 1)?;
        // Chunks come zero-filled, so the terminator is already there
        self.arena.resolve(handle)?[..text.len()].copy_from_slice(text);
        Ok(handle)
    }

    pub fn get(&self, query_id: u64) -> Result<Option<String>> {
        let entries = self.entries.read();
        entries
            .get(&query_id)
            .map(|handle| self.read_text(*handle))
            .transpose()
    }

    fn read_text(&self, handle: Handle) -> Result<String> {
        let chunk = self.arena.resolve(handle)?;
        let text = chunk.strip_suffix(&[0]).unwrap_or(&chunk);
        String::from_utf8(text.to_vec())
            .map_err(|e| Error::InvalidData(format!("query text is not UTF-8: {}", e)))
    }

    /// All texts ordered by query id.
    pub fn all(&self) -> Result<Vec<(u64, String)>> {
        let entries = self.entries.read();
        entries
            .iter()
            .sorted_by_key(|(id, _)| **id)
            .map(|(id, handle)| Ok((*id, self.read_text(*handle)?)))
            .collect()
    }

    /// Removes the text of `query_id`, returning whether it existed.
    pub fn remove_text(&self, query_id: u64) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(handle) = entries.get(&query_id).copied() else {
            return Ok(false);
        };

        // The chunk goes first, the index entry second
        self.arena.free(handle)?;
        entries.remove(&query_id);
        self.changed.store(true, Ordering::Release);
        Ok(true)
    }

    /// Removes every text but the common feature space's. Returns the number
    /// of texts removed.
    pub fn reset(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        let ids: Vec<u64> = entries
            .keys()
            .copied()
            .filter(|id| *id != DEFAULT_QUERY_ID)
            .collect();

        for id in &ids {
            let handle = entries
                .get(id)
                .copied()
                .ok_or_else(|| Error::HashTableCorrupted(format!("query text {} vanished", id)))?;
            self.arena.free(handle)?;
            entries.remove(id);
        }

        self.changed.store(true, Ordering::Release);
        Ok(ids.len())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes the snapshot if the registry changed since the last one.
    /// Returns the number of texts written.
    pub fn flush(&self) -> Result<Option<usize>> {
        let entries = self.entries.read();
        if !self.changed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(entries.len());
        for (id, handle) in entries.iter().sorted_by_key(|(id, _)| **id) {
            let chunk = self.arena.resolve(*handle)?;
            let mut record = Vec::with_capacity(8 + chunk.len());
            record.extend_from_slice(&id.to_be_bytes());
            record.extend_from_slice(&chunk);
            records.push(record);
        }

        let written = snapshot::store(&self.path, &records);
        if written.is_some() {
            self.changed.store(false, Ordering::Release);
        }
        Ok(written)
    }

    /// Fills the empty registry from the snapshot file, then makes sure the
    /// common feature space has its text.
    pub fn load(&self) -> Result<usize> {
        let loaded = {
            let mut entries = self.entries.write();
            if !entries.is_empty() {
                return Err(Error::AlreadyInitialized(self.path.display().to_string()));
            }

            let loaded = snapshot::load(&self.path, |payload| {
                let (id, text) = decode_record(payload)?;
                let handle = self.copy_in(text)?;
                if entries.insert(id, handle).is_some() {
                    return Err(Error::HashTableCorrupted(format!(
                        "duplicate text for query {}",
                        id
                    )));
                }
                Ok(())
            })?;
            // Memory now matches disk
            self.changed.store(false, Ordering::Release);
            loaded
        };

        self.store_text(DEFAULT_QUERY_ID, DEFAULT_QUERY_TEXT)?;
        Ok(loaded)
    }
}

fn decode_record(payload: &[u8]) -> Result<(u64, &[u8])> {
    if payload.len() < 9 || payload[payload.len() - 1] != 0 {
        return Err(Error::InvalidData(format!(
            "malformed query text record of {} bytes",
            payload.len()
        )));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&payload[..8]);
    let text = &payload[8..payload.len() - 1];
    if text.contains(&0) {
        return Err(Error::InvalidData(format!(
            "query text record of {} bytes has an embedded NUL",
            payload.len()
        )));
    }
    Ok((u64::from_be_bytes(id), text))
}
