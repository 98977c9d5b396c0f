use crate::encoding::bincode;
use crate::error::Result;
use crate::snapshot;
use crate::types::StatEntry;
use crate::Error;

use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Execution statistics of every query class, keyed by query id.
pub struct StatCache {
    entries: RwLock<HashMap<u64, StatEntry>>,
    path: PathBuf,
}

impl std::fmt::Debug for StatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCache")
            .field("entries", &self.entries.read().len())
            .field("path", &self.path)
            .finish()
    }
}

/// Size of a statistics snapshot record. Every entry encodes to the same
/// number of bytes.
pub fn record_size() -> usize {
    bincode::serialized_size(&StatEntry::default())
}

impl StatCache {
    /// Creates an empty cache persisted to the snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a sample to the ring of `query_id` selected by `used_model` and
    /// returns a copy of the updated entry.
    pub fn record(
        &self,
        query_id: u64,
        used_model: bool,
        plan_time: f64,
        exec_time: f64,
        est_error: f64,
    ) -> StatEntry {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(query_id)
            .or_insert_with(|| StatEntry::new(query_id));

        let ring = if used_model {
            &mut entry.with_model
        } else {
            &mut entry.without_model
        };
        ring.push(plan_time, exec_time, est_error);
        *entry
    }

    pub fn get(&self, query_id: u64) -> Option<StatEntry> {
        self.entries.read().get(&query_id).copied()
    }

    /// Copies every entry, ordered by query id.
    pub fn snapshot_all(&self) -> Vec<StatEntry> {
        self.entries
            .read()
            .values()
            .copied()
            .sorted_by_key(|entry| entry.query_id)
            .collect()
    }

    pub fn remove(&self, query_id: u64) -> bool {
        self.entries.write().remove(&query_id).is_some()
    }

    /// Removes every entry, then rewrites the snapshot. Returns the number of
    /// entries removed.
    pub fn reset(&self) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };
        self.flush();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes every entry to the snapshot file.
    pub fn flush(&self) -> Option<usize> {
        let entries = self.entries.read();
        let records: Vec<Vec<u8>> = entries
            .values()
            .sorted_by_key(|entry| entry.query_id)
            .map(bincode::serialize)
            .collect();
        snapshot::store(&self.path, &records)
    }

    /// Fills the empty cache from the snapshot file, consuming it.
    pub fn load(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            return Err(Error::AlreadyInitialized(self.path.display().to_string()));
        }

        let size = record_size();
        snapshot::load(&self.path, |payload| {
            let entry: StatEntry = bincode::deserialize_exact(payload, size)?;
            if !entry.with_model.is_valid() || !entry.without_model.is_valid() {
                return Err(Error::InvalidData(format!(
                    "statistics of query {} have impossible sample counters",
                    entry.query_id
                )));
            }
            if entries.insert(entry.query_id, entry).is_some() {
                return Err(Error::HashTableCorrupted(format!(
                    "duplicate statistics for query {}",
                    entry.query_id
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::STAT_SAMPLE_SIZE;
    use tempfile::tempdir;

    #[test]
    fn test_record_selects_ring() {
        let dir = tempdir().unwrap();
        let cache = StatCache::new(dir.path().join("stat.stat"));

        cache.record(1, true, 0.1, 1.0, 0.5);
        let entry = cache.record(1, false, 0.2, 2.0, 0.7);

        assert_eq!(entry.with_model.total, 1);
        assert_eq!(entry.without_model.total, 1);
        assert_eq!(entry.with_model.exec_times(), &[1.0]);
        assert_eq!(entry.without_model.exec_times(), &[2.0]);
        assert_eq!(cache.get(1), Some(entry));
    }

    #[test]
    fn test_returned_entry_is_a_copy() {
        let dir = tempdir().unwrap();
        let cache = StatCache::new(dir.path().join("stat.stat"));

        let first = cache.record(1, true, 0.1, 1.0, 0.5);
        cache.record(1, true, 0.1, 1.0, 0.5);
        assert_eq!(first.with_model.total, 1);
        assert_eq!(cache.get(1).unwrap().with_model.total, 2);
    }

    #[test]
    fn test_sliding_window() {
        let dir = tempdir().unwrap();
        let cache = StatCache::new(dir.path().join("stat.stat"));

        for i in 0..STAT_SAMPLE_SIZE + 5 {
            cache.record(3, false, i as f64, 0.0, 0.0);
        }
        let entry = cache.get(3).unwrap();
        assert_eq!(entry.without_model.plan_times().len(), STAT_SAMPLE_SIZE);
        assert_eq!(entry.without_model.plan_times()[0], 5.0);
        assert_eq!(entry.without_model.total, (STAT_SAMPLE_SIZE + 5) as i64);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stat.stat");

        let cache = StatCache::new(&path);
        cache.record(2, true, 0.1, 1.0, 0.5);
        cache.record(1, false, 0.2, 2.0, 0.7);
        assert_eq!(cache.flush(), Some(2));

        let restored = StatCache::new(&path);
        assert_eq!(restored.load().unwrap(), 2);
        assert_eq!(restored.snapshot_all(), cache.snapshot_all());
        assert!(!path.exists());
    }

    #[test]
    fn test_foreign_record_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stat.stat");
        snapshot::store(&path, &[vec![0u8; 16]]).unwrap();

        let cache = StatCache::new(&path);
        assert!(matches!(cache.load(), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_overfull_ring_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stat.stat");

        let mut entry = StatEntry::new(4);
        entry.with_model.len = STAT_SAMPLE_SIZE as u32 + 5;
        entry.with_model.total = 30;
        snapshot::store(&path, &[bincode::serialize(&entry)]).unwrap();

        let cache = StatCache::new(&path);
        assert!(matches!(cache.load(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_remove_and_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stat.stat");
        let cache = StatCache::new(&path);

        for id in 1..=3 {
            cache.record(id, true, 0.0, 0.0, 0.0);
        }
        assert!(cache.remove(2));
        assert!(!cache.remove(2));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.reset(), 2);
        assert!(cache.is_empty());
        // Reset leaves an empty snapshot behind
        let restored = StatCache::new(&path);
        assert_eq!(restored.load().unwrap(), 0);
    }
}
