//! Versioned heap with a unique ordered index.
//!
//! Every write creates a new tuple version. A version carries the id of the
//! transaction that created it (`xmin`) and, once superseded, the id of the
//! transaction that replaced it (`xmax`). Readers decide what they see from
//! the status of those two transactions:
//!
//! - [`Snapshot::Own`] sees committed versions plus the reader's own writes.
//! - [`Snapshot::Dirty`] additionally sees versions whose creator or
//!   replacer is still running, and reports that transaction so the caller
//!   can back off instead of waiting for it.
//!
//! # Index
//!
//! The index is a `crossbeam_skiplist::SkipMap` from `key ++ tuple_id` to
//! the tuple id. Keys are order-preserving encodings, so all versions of a
//! key sort together and a leading key component is a usable scan prefix.
//! Index entries are only added or removed while the heap write lock is
//! held, which keeps a scan under the heap read lock consistent.

use super::txn::{TxnId, TxnManager, TxnStatus, FROZEN_TXN, INVALID_TXN};

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

pub type TupleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Dirty,
    Own,
}

/// Outcome of replacing a tuple version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Ok,
    /// The calling transaction already replaced this version.
    SelfModified,
    /// A committed transaction replaced or removed this version.
    Updated,
    /// A running transaction is replacing this version.
    BeingModified,
}

/// A tuple version as seen by a scan.
#[derive(Debug, Clone)]
pub struct Version<R> {
    pub tid: TupleId,
    pub row: R,
    /// Running creator of this version. Dirty scans only.
    pub xmin: Option<TxnId>,
    /// Running replacer of this version. Dirty scans only.
    pub xmax: Option<TxnId>,
}

impl<R> Version<R> {
    /// No other transaction is working on this version.
    pub fn is_settled(&self) -> bool {
        self.xmin.is_none() && self.xmax.is_none()
    }
}

struct Tuple<R> {
    key: Vec<u8>,
    xmin: TxnId,
    xmax: TxnId,
    row: R,
}

pub struct Table<R> {
    name: &'static str,
    heap: RwLock<BTreeMap<TupleId, Tuple<R>>>,
    index: SkipMap<Vec<u8>, TupleId>,
    next_tid: AtomicU64,
}

impl<R> std::fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("versions", &self.heap.read().len())
            .finish()
    }
}

fn index_key(key: &[u8], tid: TupleId) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&tid.to_be_bytes());
    out
}

impl<R: Clone> Table<R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            heap: RwLock::new(BTreeMap::new()),
            index: SkipMap::new(),
            next_tid: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Versions visible to `me` whose key starts with `prefix`, in key order.
    pub fn scan(
        &self,
        txns: &TxnManager,
        me: TxnId,
        prefix: &[u8],
        snapshot: Snapshot,
    ) -> Vec<Version<R>> {
        let heap = self.heap.read();
        self.index
            .range(prefix.to_vec()..)
            .take_while(|entry| entry.key().starts_with(prefix))
            .filter_map(|entry| {
                let tid = *entry.value();
                let tuple = heap.get(&tid)?;
                let (xmin, xmax) = visibility(txns, me, tuple, snapshot)?;
                Some(Version {
                    tid,
                    row: tuple.row.clone(),
                    xmin,
                    xmax,
                })
            })
            .collect()
    }

    /// Inserts the first version of `key`.
    ///
    /// Returns `None` if a version of the key already exists that is not
    /// known to be gone, whether committed or still in flight.
    pub fn insert(&self, txns: &TxnManager, me: TxnId, key: &[u8], row: R) -> Option<TupleId> {
        let mut heap = self.heap.write();

        let taken = self
            .index
            .range(key.to_vec()..)
            .take_while(|entry| entry.key().starts_with(key))
            .filter(|entry| entry.key().len() == key.len() + 8)
            .filter_map(|entry| heap.get(entry.value()))
            .any(|tuple| is_live(txns, me, tuple));
        if taken {
            return None;
        }

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        heap.insert(
            tid,
            Tuple {
                key: key.to_vec(),
                xmin: me,
                xmax: INVALID_TXN,
                row,
            },
        );
        self.index.insert(index_key(key, tid), tid);
        Some(tid)
    }

    /// Replaces version `tid` with a new version holding `row`.
    pub fn update(&self, txns: &TxnManager, me: TxnId, tid: TupleId, row: R) -> UpdateResult {
        let mut heap = self.heap.write();

        let Some(tuple) = heap.get_mut(&tid) else {
            return UpdateResult::Updated;
        };

        if tuple.xmin != me {
            match txns.status(tuple.xmin) {
                TxnStatus::InProgress => return UpdateResult::BeingModified,
                TxnStatus::Aborted => return UpdateResult::Updated,
                TxnStatus::Committed => {}
            }
        }

        if tuple.xmax != INVALID_TXN {
            if tuple.xmax == me {
                return UpdateResult::SelfModified;
            }
            match txns.status(tuple.xmax) {
                TxnStatus::InProgress => return UpdateResult::BeingModified,
                TxnStatus::Committed => return UpdateResult::Updated,
                TxnStatus::Aborted => {}
            }
        }

        tuple.xmax = me;
        let key = tuple.key.clone();

        let new_tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        self.index.insert(index_key(&key, new_tid), new_tid);
        heap.insert(
            new_tid,
            Tuple {
                key,
                xmin: me,
                xmax: INVALID_TXN,
                row,
            },
        );
        UpdateResult::Ok
    }

    /// Installs a committed row recovered from the journal, dropping every
    /// earlier version of its key.
    pub fn restore(&self, key: &[u8], row: R) {
        let mut heap = self.heap.write();

        let stale: Vec<(Vec<u8>, TupleId)> = self
            .index
            .range(key.to_vec()..)
            .take_while(|entry| entry.key().starts_with(key))
            .filter(|entry| entry.key().len() == key.len() + 8)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (ikey, tid) in stale {
            self.index.remove(&ikey);
            heap.remove(&tid);
        }

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        heap.insert(
            tid,
            Tuple {
                key: key.to_vec(),
                xmin: FROZEN_TXN,
                xmax: INVALID_TXN,
                row,
            },
        );
        self.index.insert(index_key(key, tid), tid);
    }

    /// Committed rows in key order.
    pub fn committed_rows(&self, txns: &TxnManager) -> Vec<R> {
        self.scan(txns, INVALID_TXN, &[], Snapshot::Own)
            .into_iter()
            .map(|version| version.row)
            .collect()
    }

    /// Number of tuple versions, dead ones included.
    pub fn version_count(&self) -> usize {
        self.heap.read().len()
    }

    /// Removes versions made dead by the `finished` transactions and freezes
    /// the ones they committed. Returns the number of versions removed.
    pub fn vacuum(&self, finished: &HashMap<TxnId, TxnStatus>) -> usize {
        let mut heap = self.heap.write();
        let mut dead = Vec::new();

        for (tid, tuple) in heap.iter_mut() {
            match finished.get(&tuple.xmin) {
                Some(TxnStatus::Aborted) => {
                    dead.push(*tid);
                    continue;
                }
                Some(TxnStatus::Committed) => tuple.xmin = FROZEN_TXN,
                _ => {}
            }

            if tuple.xmax != INVALID_TXN {
                match finished.get(&tuple.xmax) {
                    Some(TxnStatus::Committed) if tuple.xmin == FROZEN_TXN => dead.push(*tid),
                    Some(TxnStatus::Aborted) => tuple.xmax = INVALID_TXN,
                    _ => {}
                }
            }
        }

        for tid in &dead {
            if let Some(tuple) = heap.remove(tid) {
                self.index.remove(&index_key(&tuple.key, *tid));
            }
        }

        if !dead.is_empty() {
            tracing::debug!(table = self.name, removed = dead.len(), "Vacuumed dead versions");
        }
        dead.len()
    }
}

/// Whether `tuple` is visible to `me` under `snapshot`. On success returns
/// the running creator and replacer seen by a dirty snapshot.
fn visibility<R>(
    txns: &TxnManager,
    me: TxnId,
    tuple: &Tuple<R>,
    snapshot: Snapshot,
) -> Option<(Option<TxnId>, Option<TxnId>)> {
    let mut running_xmin = None;
    if tuple.xmin != me {
        match txns.status(tuple.xmin) {
            TxnStatus::Aborted => return None,
            TxnStatus::InProgress if snapshot == Snapshot::Own => return None,
            TxnStatus::InProgress => running_xmin = Some(tuple.xmin),
            TxnStatus::Committed => {}
        }
    }

    let mut running_xmax = None;
    if tuple.xmax != INVALID_TXN {
        if tuple.xmax == me {
            return None;
        }
        match txns.status(tuple.xmax) {
            TxnStatus::Committed => return None,
            TxnStatus::InProgress if snapshot == Snapshot::Dirty => {
                running_xmax = Some(tuple.xmax)
            }
            _ => {}
        }
    }

    Some((running_xmin, running_xmax))
}

/// Whether `tuple` still occupies its key from the point of view of `me`.
fn is_live<R>(txns: &TxnManager, me: TxnId, tuple: &Tuple<R>) -> bool {
    if tuple.xmin != me && txns.status(tuple.xmin) == TxnStatus::Aborted {
        return false;
    }
    if tuple.xmax == INVALID_TXN {
        return true;
    }
    tuple.xmax != me && txns.status(tuple.xmax) != TxnStatus::Committed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TxnManager, Table<&'static str>) {
        (TxnManager::new(), Table::new("test_table"))
    }

    fn rows(versions: Vec<Version<&'static str>>) -> Vec<&'static str> {
        versions.into_iter().map(|v| v.row).collect()
    }

    #[test]
    fn test_uncommitted_insert_visibility() {
        let (txns, table) = setup();
        let writer = txns.begin();
        let reader = txns.begin();
        table.insert(&txns, writer, b"k1", "v1").unwrap();

        assert_eq!(rows(table.scan(&txns, writer, b"k1", Snapshot::Own)), vec!["v1"]);
        assert!(table.scan(&txns, reader, b"k1", Snapshot::Own).is_empty());

        let dirty = table.scan(&txns, reader, b"k1", Snapshot::Dirty);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].xmin, Some(writer));
        assert!(!dirty[0].is_settled());

        txns.finish(writer, TxnStatus::Committed);
        let dirty = table.scan(&txns, reader, b"k1", Snapshot::Dirty);
        assert!(dirty[0].is_settled());
    }

    #[test]
    fn test_aborted_insert_is_invisible() {
        let (txns, table) = setup();
        let writer = txns.begin();
        table.insert(&txns, writer, b"k1", "v1").unwrap();
        txns.finish(writer, TxnStatus::Aborted);

        let reader = txns.begin();
        assert!(table.scan(&txns, reader, b"k1", Snapshot::Dirty).is_empty());
        assert!(table.insert(&txns, reader, b"k1", "v2").is_some());
    }

    #[test]
    fn test_unique_key() {
        let (txns, table) = setup();
        let first = txns.begin();
        let second = txns.begin();

        table.insert(&txns, first, b"k1", "v1").unwrap();
        // In flight counts as taken
        assert!(table.insert(&txns, second, b"k1", "v2").is_none());

        txns.finish(first, TxnStatus::Committed);
        assert!(table.insert(&txns, second, b"k1", "v2").is_none());
        assert!(table.insert(&txns, second, b"k2", "v2").is_some());
    }

    #[test]
    fn test_update_creates_new_version() {
        let (txns, table) = setup();
        let writer = txns.begin();
        let tid = table.insert(&txns, writer, b"k1", "v1").unwrap();
        txns.finish(writer, TxnStatus::Committed);

        let updater = txns.begin();
        let reader = txns.begin();
        assert_eq!(table.update(&txns, updater, tid, "v2"), UpdateResult::Ok);

        assert_eq!(rows(table.scan(&txns, updater, b"k1", Snapshot::Own)), vec!["v2"]);
        assert_eq!(rows(table.scan(&txns, reader, b"k1", Snapshot::Own)), vec!["v1"]);

        // A dirty reader sees both versions, each flagged with the updater
        let dirty = table.scan(&txns, reader, b"k1", Snapshot::Dirty);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].xmax, Some(updater));
        assert_eq!(dirty[1].xmin, Some(updater));

        assert_eq!(table.update(&txns, updater, tid, "v3"), UpdateResult::SelfModified);
        assert_eq!(table.update(&txns, reader, tid, "v3"), UpdateResult::BeingModified);

        txns.finish(updater, TxnStatus::Committed);
        assert_eq!(table.update(&txns, reader, tid, "v3"), UpdateResult::Updated);
        assert_eq!(table.committed_rows(&txns), vec!["v2"]);
    }

    #[test]
    fn test_prefix_scan() {
        let (txns, table) = setup();
        let writer = txns.begin();
        table.insert(&txns, writer, b"a1", "a1").unwrap();
        table.insert(&txns, writer, b"a2", "a2").unwrap();
        table.insert(&txns, writer, b"b1", "b1").unwrap();
        txns.finish(writer, TxnStatus::Committed);

        let reader = txns.begin();
        assert_eq!(rows(table.scan(&txns, reader, b"a", Snapshot::Own)), vec!["a1", "a2"]);
        assert_eq!(table.committed_rows(&txns), vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn test_vacuum() {
        let (txns, table) = setup();
        let writer = txns.begin();
        let tid = table.insert(&txns, writer, b"k1", "v1").unwrap();
        txns.finish(writer, TxnStatus::Committed);

        let updater = txns.begin();
        table.update(&txns, updater, tid, "v2");
        txns.finish(updater, TxnStatus::Committed);

        let aborted = txns.begin();
        table.insert(&txns, aborted, b"k2", "gone").unwrap();
        txns.finish(aborted, TxnStatus::Aborted);

        assert_eq!(table.version_count(), 3);
        let finished = txns.finished();
        assert_eq!(table.vacuum(&finished), 2);
        txns.prune(finished.into_keys());

        // Survivors are frozen and stay visible once their creators are forgotten
        assert_eq!(table.version_count(), 1);
        assert_eq!(table.committed_rows(&txns), vec!["v2"]);
    }

    #[test]
    fn test_restore_replaces_versions() {
        let (txns, table) = setup();
        table.restore(b"k1", "v1");
        table.restore(b"k1", "v2");
        assert_eq!(table.version_count(), 1);
        assert_eq!(table.committed_rows(&txns), vec!["v2"]);
    }
}
