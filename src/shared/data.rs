//! Shared cache of kNN datasets, keyed by feature subspace.
//!
//! The index holds one fixed-size entry per key: the dataset [`Shape`] and
//! the handle of the arena chunk holding the variable part (see
//! [`crate::encoding::dataset`] for the byte layout).
//!
//! ```text
//!   index (RwLock<HashMap>)                 arena
//!   +-----------------------------+        +--------------------------------+
//!   | (fs, fss) -> shape, handle ─┼───────►| key | matrix | targets | rel.. |
//!   +-----------------------------+        +--------------------------------+
//! ```
//!
//! A chunk is never resized in place. Growing a dataset allocates a chunk of
//! the new size, writes it, frees the old chunk and only then points the
//! entry at the new one. Removing a key frees its chunk before the entry
//! leaves the index, so no entry ever refers to freed memory.

use crate::arena::{Arena, ChunkAllocator, Handle};
use crate::encoding::dataset::{self, Shape};
use crate::error::Result;
use crate::snapshot;
use crate::store::{Database, Transaction};
use crate::types::{FeatureSubspaceKey, OkNNDataset, RelationId};
use crate::Error;

use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    shape: Shape,
    handle: Handle,
    // Bumped on every write so a drain can tell whether the entry moved on
    version: u64,
}

/// A dataset copied out of the cache together with its relations.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDataset {
    pub key: FeatureSubspaceKey,
    pub data: OkNNDataset,
    pub relations: Vec<RelationId>,
}

pub struct DatasetCache {
    arena: Arc<Arena>,
    entries: RwLock<HashMap<FeatureSubspaceKey, CacheEntry>>,
    path: PathBuf,
}

impl std::fmt::Debug for DatasetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetCache")
            .field("entries", &self.entries.read().len())
            .field("arena", &self.arena)
            .field("path", &self.path)
            .finish()
    }
}

impl DatasetCache {
    pub fn new(arena: Arc<Arena>, path: impl Into<PathBuf>) -> Self {
        Self {
            arena,
            entries: RwLock::new(HashMap::new()),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: FeatureSubspaceKey) -> bool {
        self.entries.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copies the dataset of `key` out of the cache.
    ///
    /// The caller expects `cols` features; a cached dataset with another
    /// column count belongs to a colliding feature space and is not returned.
    pub fn lookup(
        &self,
        key: FeatureSubspaceKey,
        cols: i32,
    ) -> Result<Option<(OkNNDataset, Vec<RelationId>)>> {
        let entries = self.entries.write();
        let Some(entry) = entries.get(&key) else {
            return Ok(None);
        };

        if entry.shape.cols != cols {
            tracing::info!(
                fs = key.fs,
                fss = key.fss,
                cached_cols = entry.shape.cols,
                cols,
                "Feature space collision in dataset cache"
            );
            return Ok(None);
        }

        let chunk = self.arena.resolve(entry.handle)?;
        let (data, relations) = dataset::read_chunk(&chunk, &key, entry.shape)?;
        Ok(Some((data, relations)))
    }

    /// Writes `data` for `key`. Returns whether the cache changed.
    ///
    /// The first write fixes the column and relation counts of the key. Later
    /// writes that disagree with them, or that carry fewer rows than cached,
    /// are logged and dropped.
    pub fn upsert(
        &self,
        key: FeatureSubspaceKey,
        data: &OkNNDataset,
        relations: &[RelationId],
    ) -> Result<bool> {
        if !data.is_consistent() {
            return Err(Error::InvalidData(format!(
                "dataset for {} disagrees with its own shape",
                key
            )));
        }
        if relations.contains(&0) {
            return Err(Error::InvalidRelation);
        }

        let shape = Shape::of(data, relations);
        let mut entries = self.entries.write();

        let Some(current) = entries.get(&key).copied() else {
            let handle = self.allocate_written(&key, shape, data, relations)?;
            entries.insert(
                key,
                CacheEntry {
                    shape,
                    handle,
                    version: 0,
                },
            );
            return Ok(true);
        };

        if current.shape.cols != shape.cols || current.shape.nrels != shape.nrels {
            tracing::info!(
                fs = key.fs,
                fss = key.fss,
                cached_cols = current.shape.cols,
                cols = shape.cols,
                cached_relations = current.shape.nrels,
                relations = shape.nrels,
                "Feature space collision in dataset cache, skipping write"
            );
            return Ok(false);
        }
        if shape.rows < current.shape.rows {
            tracing::info!(
                fs = key.fs,
                fss = key.fss,
                cached_rows = current.shape.rows,
                rows = shape.rows,
                "Cached dataset is larger, skipping write"
            );
            return Ok(false);
        }

        let handle = if shape.rows > current.shape.rows {
            let handle = self.allocate_written(&key, shape, data, relations)?;
            self.arena.free(current.handle)?;
            handle
        } else {
            let mut chunk = self.arena.resolve(current.handle)?;
            dataset::write_chunk(&mut chunk, &key, data, relations)?;
            current.handle
        };

        entries.insert(
            key,
            CacheEntry {
                shape,
                handle,
                version: current.version + 1,
            },
        );
        Ok(true)
    }

    fn allocate_written(
        &self,
        key: &FeatureSubspaceKey,
        shape: Shape,
        data: &OkNNDataset,
        relations: &[RelationId],
    ) -> Result<Handle> {
        let handle = self.arena.allocate(shape.chunk_size()?)?;
        let written = {
            let mut chunk = self.arena.resolve(handle)?;
            dataset::write_chunk(&mut chunk, key, data, relations)
        };
        if let Err(err) = written {
            self.arena.free(handle)?;
            return Err(err);
        }
        Ok(handle)
    }

    /// Drops the dataset of `key`, returning whether it was cached.
    pub fn remove(&self, key: FeatureSubspaceKey) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(&key).copied() else {
            return Ok(false);
        };
        self.arena.free(entry.handle)?;
        entries.remove(&key);
        Ok(true)
    }

    /// Drops every cached dataset. Returns the number removed.
    pub fn reset(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        let keys: Vec<FeatureSubspaceKey> = entries.keys().copied().collect();
        for key in &keys {
            if let Some(entry) = entries.get(key).copied() {
                self.arena.free(entry.handle)?;
                entries.remove(key);
            }
        }
        Ok(keys.len())
    }

    /// Copies every cached dataset, ordered by key.
    pub fn entries(&self) -> Result<Vec<CachedDataset>> {
        let entries = self.entries.read();
        entries
            .iter()
            .sorted_by_key(|(key, _)| **key)
            .map(|(key, entry)| {
                let chunk = self.arena.resolve(entry.handle)?;
                let (data, relations) = dataset::read_chunk(&chunk, key, entry.shape)?;
                Ok(CachedDataset {
                    key: *key,
                    data,
                    relations,
                })
            })
            .collect()
    }

    /// Writes every cached dataset to the snapshot file.
    pub fn flush(&self) -> Result<Option<usize>> {
        let records = self
            .entries()?
            .iter()
            .map(|cached| dataset::encode_record(&cached.key, &cached.data, &cached.relations))
            .collect::<Result<Vec<_>>>()?;
        Ok(snapshot::store(&self.path, &records))
    }

    /// Fills the empty cache from the snapshot file, consuming it.
    pub fn load(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            return Err(Error::AlreadyInitialized(self.path.display().to_string()));
        }

        snapshot::load(&self.path, |payload| {
            let (key, data, relations) = dataset::decode_record(payload)?;
            if entries.contains_key(&key) {
                return Err(Error::HashTableCorrupted(format!(
                    "duplicate dataset for {}",
                    key
                )));
            }
            let shape = Shape::of(&data, &relations);
            let handle = self.allocate_written(&key, shape, &data, &relations)?;
            entries.insert(
                key,
                CacheEntry {
                    shape,
                    handle,
                    version: 0,
                },
            );
            Ok(())
        })
    }

    /// Moves every cached dataset into the durable store within `txn`.
    ///
    /// Entries the store accepted are removed from the cache, unless they were
    /// written again while the drain was running. Returns the number of
    /// datasets written to the store.
    pub fn drain_into(&self, db: &Database, txn: &Transaction<'_>) -> Result<usize> {
        let pending: Vec<(CachedDataset, u64)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .sorted_by_key(|(key, _)| **key)
                .map(|(key, entry)| {
                    let chunk = self.arena.resolve(entry.handle)?;
                    let (data, relations) = dataset::read_chunk(&chunk, key, entry.shape)?;
                    Ok((
                        CachedDataset {
                            key: *key,
                            data,
                            relations,
                        },
                        entry.version,
                    ))
                })
                .collect::<Result<_>>()?
        };

        // The store is written without holding the cache lock
        let mut written = Vec::new();
        for (cached, version) in pending {
            let outcome = db.upsert_dataset(txn, cached.key, &cached.data, &cached.relations)?;
            if outcome.is_applied() {
                written.push((cached.key, version));
            } else {
                tracing::debug!(key = %cached.key, ?outcome, "Cached dataset kept");
            }
        }

        let mut entries = self.entries.write();
        for (key, version) in &written {
            match entries.get(key).copied() {
                Some(entry) if entry.version == *version => {
                    self.arena.free(entry.handle)?;
                    entries.remove(key);
                }
                _ => {}
            }
        }
        Ok(written.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Search;
    use tempfile::tempdir;

    fn dataset(cols: i32, rows: usize, seed: f64) -> OkNNDataset {
        let mut data = OkNNDataset::new(cols);
        for i in 0..rows {
            let features: Vec<f64> = (0..cols).map(|c| seed + i as f64 + c as f64 / 10.0).collect();
            data.push_row(&features, seed * 10.0 + i as f64, 1.0);
        }
        data
    }

    fn cache(path: &Path) -> (Arc<Arena>, DatasetCache) {
        let arena = Arc::new(Arena::new("datasets", 1024, 1 << 20));
        let cache = DatasetCache::new(Arc::clone(&arena), path);
        (arena, cache)
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let (_, cache) = cache(&dir.path().join("data.stat"));
        let key = FeatureSubspaceKey::new(1, 7);

        assert!(cache.upsert(key, &dataset(2, 3, 1.0), &[16384]).unwrap());
        assert!(cache.contains(key));

        let (data, relations) = cache.lookup(key, 2).unwrap().unwrap();
        assert_eq!(data, dataset(2, 3, 1.0));
        assert_eq!(relations, vec![16384]);
        assert_eq!(cache.lookup(FeatureSubspaceKey::new(2, 7), 2).unwrap(), None);
    }

    #[test]
    fn test_growth_moves_chunk() {
        let dir = tempdir().unwrap();
        let (arena, cache) = cache(&dir.path().join("data.stat"));
        let key = FeatureSubspaceKey::new(1, 7);

        cache.upsert(key, &dataset(2, 2, 1.0), &[]).unwrap();
        let small = arena.allocated_bytes();
        cache.upsert(key, &dataset(2, 5, 1.0), &[]).unwrap();

        // The old chunk went back to the arena
        assert_eq!(arena.chunk_count(), 1);
        assert!(arena.allocated_bytes() > small);
        let (data, _) = cache.lookup(key, 2).unwrap().unwrap();
        assert_eq!(data.rows, 5);
        assert_eq!(data.row(0), dataset(2, 2, 1.0).row(0));
    }

    #[test]
    fn test_same_size_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let (arena, cache) = cache(&dir.path().join("data.stat"));
        let key = FeatureSubspaceKey::new(1, 7);

        cache.upsert(key, &dataset(1, 2, 1.0), &[5]).unwrap();
        let bytes = arena.allocated_bytes();
        assert!(cache.upsert(key, &dataset(1, 2, 9.0), &[6]).unwrap());

        assert_eq!(arena.allocated_bytes(), bytes);
        let (data, relations) = cache.lookup(key, 1).unwrap().unwrap();
        assert_eq!(data, dataset(1, 2, 9.0));
        assert_eq!(relations, vec![6]);
    }

    #[test]
    fn test_collision_leaves_entry_untouched() {
        let dir = tempdir().unwrap();
        let (_, cache) = cache(&dir.path().join("data.stat"));
        let key = FeatureSubspaceKey::new(3, -1);

        cache.upsert(key, &dataset(2, 3, 1.0), &[1, 2]).unwrap();
        assert!(!cache.upsert(key, &dataset(3, 4, 2.0), &[1, 2]).unwrap());
        assert!(!cache.upsert(key, &dataset(2, 4, 2.0), &[1]).unwrap());
        assert!(!cache.upsert(key, &dataset(2, 1, 2.0), &[1, 2]).unwrap());

        assert_eq!(cache.lookup(key, 3).unwrap(), None);
        let (data, _) = cache.lookup(key, 2).unwrap().unwrap();
        assert_eq!(data, dataset(2, 3, 1.0));
    }

    #[test]
    fn test_invalid_input() {
        let dir = tempdir().unwrap();
        let (arena, cache) = cache(&dir.path().join("data.stat"));
        let key = FeatureSubspaceKey::new(3, 3);

        assert!(matches!(
            cache.upsert(key, &dataset(1, 1, 0.0), &[0]),
            Err(Error::InvalidRelation)
        ));
        let mut broken = dataset(2, 2, 0.0);
        broken.targets.pop();
        assert!(matches!(
            cache.upsert(key, &broken, &[]),
            Err(Error::InvalidData(_))
        ));
        assert_eq!(arena.chunk_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_reset_free_chunks() {
        let dir = tempdir().unwrap();
        let (arena, cache) = cache(&dir.path().join("data.stat"));

        for fs in 0..4 {
            cache
                .upsert(FeatureSubspaceKey::new(fs, 1), &dataset(1, 2, 0.0), &[])
                .unwrap();
        }
        assert!(cache.remove(FeatureSubspaceKey::new(2, 1)).unwrap());
        assert!(!cache.remove(FeatureSubspaceKey::new(2, 1)).unwrap());
        assert_eq!(arena.chunk_count(), 3);

        assert_eq!(cache.reset().unwrap(), 3);
        assert_eq!(arena.chunk_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.stat");
        let (_, cache) = cache(&path);

        cache
            .upsert(FeatureSubspaceKey::new(9, 2), &dataset(3, 2, 1.0), &[10, 11])
            .unwrap();
        cache
            .upsert(FeatureSubspaceKey::new(4, 2), &dataset(0, 3, 2.0), &[])
            .unwrap();
        assert_eq!(cache.flush().unwrap(), Some(2));

        let (_, restored) = self::cache(&path);
        assert_eq!(restored.load().unwrap(), 2);
        assert_eq!(restored.entries().unwrap(), cache.entries().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_drain_into_store() {
        let dir = tempdir().unwrap();
        let (arena, cache) = cache(&dir.path().join("data.stat"));
        let db = Database::in_memory();

        let fresh = FeatureSubspaceKey::new(1, 1);
        let colliding = FeatureSubspaceKey::new(2, 1);
        cache.upsert(fresh, &dataset(2, 2, 1.0), &[]).unwrap();
        cache.upsert(colliding, &dataset(2, 2, 1.0), &[]).unwrap();

        // The store already knows `colliding` with another shape
        let txn = db.begin();
        db.upsert_dataset(&txn, colliding, &dataset(4, 1, 0.0), &[])
            .unwrap();
        txn.commit().unwrap();

        let txn = db.begin();
        assert_eq!(cache.drain_into(&db, &txn).unwrap(), 1);
        txn.commit().unwrap();

        assert!(!cache.contains(fresh));
        assert!(cache.contains(colliding));
        assert_eq!(arena.chunk_count(), 1);

        let txn = db.begin_read_only();
        let (data, _) = db
            .lookup_dataset(&txn, fresh, 2, Search::Exact)
            .unwrap()
            .unwrap();
        assert_eq!(data, dataset(2, 2, 1.0));
    }
}
