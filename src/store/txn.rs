use super::journal::{JournalBatch, JournalOp, Relation};
use super::Database;
use crate::error::Result;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub type TxnId = u64;

/// No transaction. Used for an unset `xmax`.
pub const INVALID_TXN: TxnId = 0;
/// Creator of rows recovered from the journal or frozen by vacuum. Always
/// committed.
pub const FROZEN_TXN: TxnId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    Committed,
    Aborted,
}

/// Tracks the outcome of every transaction a tuple may still refer to.
pub struct TxnManager {
    next_id: AtomicU64,
    status: RwLock<HashMap<TxnId, TxnStatus>>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FROZEN_TXN + 1),
            status: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.status.write().insert(id, TxnStatus::InProgress);
        id
    }

    /// Status of `id`. Ids that were never issued, or were pruned by vacuum
    /// after aborting, read as aborted.
    pub fn status(&self, id: TxnId) -> TxnStatus {
        if id == FROZEN_TXN {
            return TxnStatus::Committed;
        }
        self.status
            .read()
            .get(&id)
            .copied()
            .unwrap_or(TxnStatus::Aborted)
    }

    pub(crate) fn finish(&self, id: TxnId, status: TxnStatus) {
        self.status.write().insert(id, status);
    }

    /// Finished transactions and their outcome.
    pub(crate) fn finished(&self) -> HashMap<TxnId, TxnStatus> {
        self.status
            .read()
            .iter()
            .filter(|(_, s)| **s != TxnStatus::InProgress)
            .map(|(id, s)| (*id, *s))
            .collect()
    }

    /// Forgets finished transactions no tuple refers to anymore.
    pub(crate) fn prune(&self, ids: impl IntoIterator<Item = TxnId>) {
        let mut status = self.status.write();
        for id in ids {
            status.remove(&id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.status
            .read()
            .values()
            .filter(|s| **s == TxnStatus::InProgress)
            .count()
    }
}

/// A unit of work against the durable store.
///
/// Dropping a transaction without committing aborts it.
pub struct Transaction<'db> {
    db: &'db Database,
    id: TxnId,
    read_only: bool,
    writes: Mutex<Vec<JournalOp>>,
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, read_only: bool) -> Self {
        Self {
            db,
            id: db.txns().begin(),
            read_only,
            writes: Mutex::new(Vec::new()),
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn record_write(&self, relation: Relation, key: Vec<u8>, row: Vec<u8>) {
        self.writes.lock().push(JournalOp { relation, key, row });
    }

    /// Makes the transaction's writes durable and visible.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let ops = std::mem::take(&mut *self.writes.lock());

        if !ops.is_empty() {
            let batch = JournalBatch { txn: self.id, ops };
            if let Err(e) = self.db.append_journal(&batch) {
                tracing::error!(txn = self.id, error = %e, "Journal write failed, aborting");
                self.db.txns().finish(self.id, TxnStatus::Aborted);
                return Err(e);
            }
        }

        self.db.txns().finish(self.id, TxnStatus::Committed);
        Ok(())
    }

    pub fn abort(mut self) {
        self.finished = true;
        self.db.txns().finish(self.id, TxnStatus::Aborted);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(txn = self.id, "Transaction dropped without commit, aborting");
            self.db.txns().finish(self.id, TxnStatus::Aborted);
        }
    }
}
