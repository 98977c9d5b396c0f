use super::journal::Relation;
use super::table::Snapshot;
use super::{Database, Refusal, Transaction, UpsertOutcome};
use crate::encoding::Key;
use crate::error::Result;
use crate::types::{FeatureSubspaceKey, OkNNDataset, RelationId};
use crate::Error;

use serde::{Deserialize, Serialize};

/// Row of the `kb_data` relation.
///
/// `matrix` is absent for datasets without features. `relations` is written
/// with the first version of a row and kept by every later update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub fs: u64,
    pub fss: i32,
    pub cols: i32,
    pub matrix: Option<Vec<f64>>,
    pub targets: Vec<f64>,
    pub reliability: Vec<f64>,
    pub relations: Option<Vec<RelationId>>,
}

impl DataRow {
    fn new(key: FeatureSubspaceKey, data: &OkNNDataset, relations: &[RelationId]) -> Self {
        Self {
            fs: key.fs,
            fss: key.fss,
            cols: data.cols,
            matrix: (data.cols > 0).then(|| data.matrix.clone()),
            targets: data.targets.clone(),
            reliability: data.reliability.clone(),
            relations: (!relations.is_empty()).then(|| relations.to_vec()),
        }
    }

    pub fn key(&self) -> FeatureSubspaceKey {
        FeatureSubspaceKey::new(self.fs, self.fss)
    }

    pub fn rows(&self) -> i32 {
        self.targets.len() as i32
    }

    pub fn relations(&self) -> &[RelationId] {
        self.relations.as_deref().unwrap_or(&[])
    }

    /// Copies this row into `data` unless `data` already holds a dataset.
    fn fill(&self, data: &mut OkNNDataset) -> Result<()> {
        if data.rows >= 0 {
            return Ok(());
        }

        let rows = self.targets.len();
        let matrix = match (&self.matrix, self.cols) {
            (Some(matrix), cols) if cols > 0 && matrix.len() == rows * cols as usize => {
                matrix.clone()
            }
            (None, 0) => Vec::new(),
            _ => {
                return Err(Error::InvalidData(format!(
                    "matrix of {} does not hold {} rows of {} columns",
                    self.key(),
                    rows,
                    self.cols
                )))
            }
        };
        if self.reliability.len() != rows {
            return Err(Error::InvalidData(format!(
                "{} has {} targets but {} reliability factors",
                self.key(),
                rows,
                self.reliability.len()
            )));
        }

        data.matrix = matrix;
        data.targets = self.targets.clone();
        data.reliability = self.reliability.clone();
        data.rows = rows as i32;
        Ok(())
    }
}

/// Which rows a dataset lookup reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    /// Only the row of the exact `(fs, fss)` key.
    Exact,
    /// Every row of the subspace `fss`, whatever its feature space.
    Subspace,
}

fn data_key(key: FeatureSubspaceKey) -> Vec<u8> {
    (key.fss, key.fs).encode()
}

impl Database {
    /// Loads the dataset of `key` from the durable store.
    ///
    /// A [`Search::Subspace`] lookup reads every row of `key.fss` and accepts
    /// the first one in index order (ascending `fs`). Rows with another column
    /// count are collisions: they end an exact search empty handed and are
    /// skipped by a subspace one. Once a row is accepted, later rows must
    /// depend on the same relations or are reported and skipped; either way
    /// they do not contribute.
    ///
    /// Returns the dataset and its relations if the accepted row holds at
    /// least one observation.
    pub fn lookup_dataset(
        &self,
        txn: &Transaction<'_>,
        key: FeatureSubspaceKey,
        cols: i32,
        search: Search,
    ) -> Result<Option<(OkNNDataset, Vec<RelationId>)>> {
        let table = self.data_table()?;
        let prefix = match search {
            Search::Exact => data_key(key),
            Search::Subspace => key.fss.encode(),
        };

        let mut data = OkNNDataset::unset(cols);
        let mut accepted: Option<Vec<RelationId>> = None;

        for version in table.scan(self.txns(), txn.id(), &prefix, Snapshot::Own) {
            let row = version.row;
            if row.cols != cols {
                if search == Search::Subspace {
                    continue;
                }
                tracing::info!(
                    fs = key.fs,
                    fss = key.fss,
                    expected = cols,
                    actual = row.cols,
                    "Feature space collision, ignoring stored data"
                );
                break;
            }

            let relations = row.relations();
            if relations.contains(&0) {
                return Err(Error::InvalidRelation);
            }

            if let Some(accepted) = &accepted {
                if accepted.len() != relations.len() {
                    tracing::info!(
                        fs = row.fs,
                        fss = row.fss,
                        expected = accepted.len(),
                        actual = relations.len(),
                        "Dependent relation count differs, skipping row"
                    );
                    continue;
                }
                if let Some(rel) = relations.iter().find(|rel| !accepted.contains(*rel)) {
                    tracing::info!(
                        fs = row.fs,
                        fss = row.fss,
                        relation = rel,
                        "Unexpected dependent relation, skipping row"
                    );
                    continue;
                }
            }

            if data.rows < 0 {
                accepted = Some(relations.to_vec());
                row.fill(&mut data)?;
            }
        }

        if data.rows > 0 {
            Ok(Some((data, accepted.unwrap_or_default())))
        } else {
            Ok(None)
        }
    }

    /// Inserts or replaces the dataset of `key`.
    ///
    /// A stored row with another column count or relation count is a
    /// collision and a write with fewer rows than stored is stale; both are
    /// logged and refused, leaving the stored row untouched.
    pub fn upsert_dataset(
        &self,
        txn: &Transaction<'_>,
        key: FeatureSubspaceKey,
        data: &OkNNDataset,
        relations: &[RelationId],
    ) -> Result<UpsertOutcome> {
        if !data.is_consistent() {
            return Err(Error::InvalidData(format!(
                "dataset for {} disagrees with its own shape",
                key
            )));
        }
        if relations.contains(&0) {
            return Err(Error::InvalidRelation);
        }

        let table = self.data_table()?;
        self.upsert(
            txn,
            &table,
            Relation::Data,
            &data_key(key),
            &key,
            DataRow::new(key, data, relations),
            |stored| {
                if stored.cols != data.cols || stored.relations().len() != relations.len() {
                    tracing::info!(
                        fs = key.fs,
                        fss = key.fss,
                        stored_cols = stored.cols,
                        cols = data.cols,
                        stored_relations = stored.relations().len(),
                        relations = relations.len(),
                        "Feature space collision, skipping write"
                    );
                    return Err(Refusal::Collision);
                }
                if data.rows < stored.rows() {
                    tracing::info!(
                        fs = key.fs,
                        fss = key.fss,
                        stored_rows = stored.rows(),
                        rows = data.rows,
                        "Dataset shrank, skipping write"
                    );
                    return Err(Refusal::Stale);
                }

                let fresh = DataRow::new(key, data, relations);
                Ok(DataRow {
                    matrix: fresh.matrix,
                    targets: fresh.targets,
                    reliability: fresh.reliability,
                    ..stored.clone()
                })
            },
        )
    }

    /// Committed datasets ordered by `(fss, fs)`.
    pub fn datasets(&self) -> Result<Vec<DataRow>> {
        Ok(self.data_table()?.committed_rows(self.txns()))
    }
}
