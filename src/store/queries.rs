use super::journal::Relation;
use super::table::Snapshot;
use super::{Database, Transaction, UpsertOutcome};
use crate::encoding::Key;
use crate::error::Result;
use crate::types::{QueryContext, QueryRegistration};

impl Database {
    /// Looks up the registration of a query class.
    ///
    /// Uses a dirty snapshot, so a registration inserted by a transaction
    /// that is still running is already found.
    pub fn find_query(&self, txn: &Transaction<'_>, query_hash: u64) -> Result<Option<QueryContext>> {
        let table = self.queries_table()?;
        let found = table
            .scan(self.txns(), txn.id(), &query_hash.encode(), Snapshot::Dirty)
            .into_iter()
            .next();
        Ok(found.map(|version| QueryContext::from(&version.row)))
    }

    /// Inserts or replaces the registration of `reg.query_hash`.
    pub fn upsert_query(
        &self,
        txn: &Transaction<'_>,
        reg: &QueryRegistration,
    ) -> Result<UpsertOutcome> {
        let table = self.queries_table()?;
        self.upsert(
            txn,
            &table,
            Relation::Queries,
            &reg.query_hash.encode(),
            &reg.query_hash,
            *reg,
            |_| Ok(*reg),
        )
    }

    /// Committed registrations ordered by query hash.
    pub fn queries(&self) -> Result<Vec<QueryRegistration>> {
        Ok(self.queries_table()?.committed_rows(self.txns()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Refusal;

    fn registration(query_hash: u64) -> QueryRegistration {
        QueryRegistration {
            query_hash,
            learn: true,
            use_model: true,
            fspace_hash: 99,
            auto_tuning: true,
        }
    }

    #[test]
    fn test_insert_then_update() {
        let db = Database::in_memory();

        let txn = db.begin();
        assert_eq!(
            db.upsert_query(&txn, &registration(42)).unwrap(),
            UpsertOutcome::Inserted
        );
        txn.commit().unwrap();

        let txn = db.begin();
        let updated = QueryRegistration {
            use_model: false,
            ..registration(42)
        };
        assert_eq!(db.upsert_query(&txn, &updated).unwrap(), UpsertOutcome::Updated);

        let ctx = db.find_query(&txn, 42).unwrap().unwrap();
        assert!(!ctx.use_model);
        assert!(ctx.collect_stat);
        txn.commit().unwrap();

        assert_eq!(db.queries().unwrap(), vec![updated]);
    }

    #[test]
    fn test_concurrent_writer_is_refused() {
        let db = Database::in_memory();

        let t1 = db.begin();
        db.upsert_query(&t1, &registration(42)).unwrap();

        let t2 = db.begin();
        // The dirty snapshot sees the uncommitted registration
        assert!(db.find_query(&t2, 42).unwrap().is_some());
        assert_eq!(
            db.upsert_query(&t2, &registration(42)).unwrap(),
            UpsertOutcome::Refused(Refusal::ConcurrentConflict)
        );

        t1.commit().unwrap();
        let t3 = db.begin();
        assert_eq!(
            db.upsert_query(&t3, &registration(42)).unwrap(),
            UpsertOutcome::Updated
        );
    }

    #[test]
    fn test_repeated_upsert_in_one_transaction() {
        let db = Database::in_memory();
        let txn = db.begin();
        assert_eq!(
            db.upsert_query(&txn, &registration(7)).unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            db.upsert_query(&txn, &registration(7)).unwrap(),
            UpsertOutcome::Updated
        );
        txn.commit().unwrap();
        assert_eq!(db.queries().unwrap().len(), 1);
    }
}
