//! Durable, transactional record store for query registrations and datasets.
//!
//! Two relations live here: `kb_queries`, keyed by query hash, and
//! `kb_data`, keyed by `(fss, fs)`. Both are [`Table`]s: versioned heaps with
//! a unique ordered index.
//!
//! # Upsert Protocol
//!
//! Writers never wait for each other. An upsert first looks up the key with a
//! dirty snapshot, which also sees versions created or replaced by running
//! transactions:
//!
//! ```text
//!   read-only transaction ───────────────────────────► Refused(ReadOnly)
//!   no version ──────► insert ──┬─ ok ───────────────► Inserted
//!                               └─ key taken ────────► Refused(ConcurrentConflict)
//!   settled version ─► update ──┬─ ok ───────────────► Updated
//!                               └─ changed under us ─► Err(ForeignWriterConflict)
//!   version in flight ───────────────────────────────► Refused(ConcurrentConflict)
//! ```
//!
//! A refusal means "skip this learning opportunity". A version that changes
//! between the dirty read and the update can only come from a writer that
//! does not follow this protocol, which is a hard error.
//!
//! # Durability
//!
//! Committed writes are appended to the [`journal`] before they become
//! visible, and replayed when the store is opened again.
//!
//! A relation can be dropped at runtime to model a schema that disappeared
//! underneath the process. Every operation on it then fails with
//! [`Error::RelationMissing`]. Dropping is not journaled.

pub mod data;
pub mod journal;
pub mod queries;
pub mod table;
pub mod txn;

pub use data::{DataRow, Search};
pub use table::{Snapshot, Table, UpdateResult};
pub use txn::{Transaction, TxnId, TxnManager, TxnStatus};

use crate::error::Result;
use crate::types::QueryRegistration;
use crate::Error;

use journal::{Journal, JournalBatch, Relation};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

pub const QUERIES_RELATION: &str = "kb_queries";
pub const DATA_RELATION: &str = "kb_data";

/// Why an upsert was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The enclosing transaction may not write.
    ReadOnly,
    /// Another transaction is writing the same key.
    ConcurrentConflict,
    /// The stored row has another shape, so the key belongs to different data.
    Collision,
    /// The write holds fewer observations than the stored row.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Refused(Refusal),
}

impl UpsertOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpsertOutcome::Refused(_))
    }
}

pub struct Database {
    txns: TxnManager,
    queries: RwLock<Option<Arc<Table<QueryRegistration>>>>,
    data: RwLock<Option<Arc<Table<DataRow>>>>,
    journal: Option<Mutex<Journal>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("queries", &*self.queries.read())
            .field("data", &*self.data.read())
            .field("journal", &self.journal)
            .finish()
    }
}

impl Database {
    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self {
            txns: TxnManager::new(),
            queries: RwLock::new(Some(Arc::new(Table::new(QUERIES_RELATION)))),
            data: RwLock::new(Some(Arc::new(Table::new(DATA_RELATION)))),
            journal: None,
        }
    }

    /// Opens the store journaled at `path`, replaying committed writes.
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        let (journal, batches) = Journal::open(path, sync)?;
        let mut db = Self::in_memory();

        let mut rows = 0;
        for batch in &batches {
            for op in &batch.ops {
                match op.relation {
                    Relation::Queries => {
                        let row: QueryRegistration =
                            crate::encoding::bincode::deserialize(&op.row)?;
                        db.queries_table()?.restore(&op.key, row);
                    }
                    Relation::Data => {
                        let row: DataRow = crate::encoding::bincode::deserialize(&op.row)?;
                        db.data_table()?.restore(&op.key, row);
                    }
                }
                rows += 1;
            }
        }

        tracing::info!(
            path = %path.display(),
            transactions = batches.len(),
            rows,
            "Recovered durable store"
        );

        db.journal = Some(Mutex::new(journal));
        Ok(db)
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self, false)
    }

    pub fn begin_read_only(&self) -> Transaction<'_> {
        Transaction::new(self, true)
    }

    pub fn txns(&self) -> &TxnManager {
        &self.txns
    }

    pub(crate) fn append_journal(&self, batch: &JournalBatch) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.lock().append(batch),
            None => Ok(()),
        }
    }

    /// Drops both relations and their contents.
    pub fn drop_relations(&self) {
        *self.queries.write() = None;
        *self.data.write() = None;
        tracing::warn!("Knowledge base relations dropped");
    }

    /// Creates whichever relation is missing, empty.
    pub fn create_relations(&self) {
        self.queries
            .write()
            .get_or_insert_with(|| Arc::new(Table::new(QUERIES_RELATION)));
        self.data
            .write()
            .get_or_insert_with(|| Arc::new(Table::new(DATA_RELATION)));
    }

    pub fn has_relations(&self) -> bool {
        self.queries.read().is_some() && self.data.read().is_some()
    }

    pub(crate) fn queries_table(&self) -> Result<Arc<Table<QueryRegistration>>> {
        self.queries
            .read()
            .clone()
            .ok_or(Error::RelationMissing(QUERIES_RELATION))
    }

    pub(crate) fn data_table(&self) -> Result<Arc<Table<DataRow>>> {
        self.data
            .read()
            .clone()
            .ok_or(Error::RelationMissing(DATA_RELATION))
    }

    /// Reclaims dead row versions left by finished transactions.
    pub fn vacuum(&self) -> usize {
        let finished = self.txns.finished();
        let mut removed = 0;
        if let Ok(table) = self.queries_table() {
            removed += table.vacuum(&finished);
        }
        if let Ok(table) = self.data_table() {
            removed += table.vacuum(&finished);
        }
        self.txns.prune(finished.into_keys());
        removed
    }

    /// Inserts `row` under `key`, or replaces the settled version with the
    /// result of `merge`, following the upsert protocol.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn upsert<R, F>(
        &self,
        txn: &Transaction<'_>,
        table: &Table<R>,
        relation: Relation,
        key: &[u8],
        label: &dyn Display,
        row: R,
        merge: F,
    ) -> Result<UpsertOutcome>
    where
        R: Clone + Serialize,
        F: FnOnce(&R) -> std::result::Result<R, Refusal>,
    {
        if txn.is_read_only() {
            return Ok(UpsertOutcome::Refused(Refusal::ReadOnly));
        }

        let current = table
            .scan(&self.txns, txn.id(), key, Snapshot::Dirty)
            .into_iter()
            .next();

        let Some(current) = current else {
            let payload = crate::encoding::bincode::serialize(&row);
            return match table.insert(&self.txns, txn.id(), key, row) {
                Some(_) => {
                    txn.record_write(relation, key.to_vec(), payload);
                    Ok(UpsertOutcome::Inserted)
                }
                None => {
                    tracing::debug!(relation = table.name(), key = %label, "Key taken by a concurrent insert");
                    Ok(UpsertOutcome::Refused(Refusal::ConcurrentConflict))
                }
            };
        };

        if !current.is_settled() {
            tracing::debug!(
                relation = table.name(),
                key = %label,
                xmin = ?current.xmin,
                xmax = ?current.xmax,
                "Row is being written by another transaction"
            );
            return Ok(UpsertOutcome::Refused(Refusal::ConcurrentConflict));
        }

        let merged = match merge(&current.row) {
            Ok(merged) => merged,
            Err(refusal) => return Ok(UpsertOutcome::Refused(refusal)),
        };
        let payload = crate::encoding::bincode::serialize(&merged);

        match table.update(&self.txns, txn.id(), current.tid, merged) {
            UpdateResult::Ok => {
                txn.record_write(relation, key.to_vec(), payload);
                Ok(UpsertOutcome::Updated)
            }
            UpdateResult::SelfModified => Err(Error::TupleSelfModified(table.name())),
            UpdateResult::Updated | UpdateResult::BeingModified => {
                tracing::error!(relation = table.name(), key = %label, "Row changed between read and update");
                Err(Error::ForeignWriterConflict {
                    relation: table.name(),
                    key: label.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registration(query_hash: u64, learn: bool) -> QueryRegistration {
        QueryRegistration {
            query_hash,
            learn,
            use_model: true,
            fspace_hash: query_hash,
            auto_tuning: false,
        }
    }

    #[test]
    fn test_dropped_relations() {
        let db = Database::in_memory();
        db.drop_relations();
        assert!(!db.has_relations());

        let txn = db.begin();
        assert!(matches!(
            db.find_query(&txn, 1),
            Err(Error::RelationMissing(QUERIES_RELATION))
        ));
        assert!(matches!(
            db.upsert_query(&txn, &registration(1, true)),
            Err(Error::RelationMissing(QUERIES_RELATION))
        ));
        drop(txn);

        db.create_relations();
        let txn = db.begin();
        assert_eq!(db.find_query(&txn, 1).unwrap(), None);
    }

    #[test]
    fn test_read_only_refused() {
        let db = Database::in_memory();
        let txn = db.begin_read_only();
        assert_eq!(
            db.upsert_query(&txn, &registration(1, true)).unwrap(),
            UpsertOutcome::Refused(Refusal::ReadOnly)
        );
    }

    #[test]
    fn test_journal_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kb_store.journal");

        {
            let db = Database::open(&path, true).unwrap();

            let txn = db.begin();
            db.upsert_query(&txn, &registration(1, true)).unwrap();
            txn.commit().unwrap();

            let txn = db.begin();
            db.upsert_query(&txn, &registration(1, false)).unwrap();
            txn.commit().unwrap();

            // Never committed
            let txn = db.begin();
            db.upsert_query(&txn, &registration(2, true)).unwrap();
            txn.abort();
        }

        let db = Database::open(&path, true).unwrap();
        let txn = db.begin();
        let ctx = db.find_query(&txn, 1).unwrap().unwrap();
        assert!(!ctx.learn);
        assert_eq!(db.find_query(&txn, 2).unwrap(), None);
    }

    #[test]
    fn test_vacuum_keeps_latest() {
        let db = Database::in_memory();
        for learn in [true, false, true] {
            let txn = db.begin();
            db.upsert_query(&txn, &registration(5, learn)).unwrap();
            txn.commit().unwrap();
        }

        assert_eq!(db.vacuum(), 2);
        assert_eq!(db.txns().finished().len(), 0);

        let txn = db.begin();
        assert!(db.find_query(&txn, 5).unwrap().unwrap().learn);
    }
}
