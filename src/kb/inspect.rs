//! Tabular dumps and point deletes for administrators.

use super::KnowledgeBase;
use crate::error::Result;
use crate::types::{FeatureSubspaceKey, RelationId, StatEntry};

use itertools::Itertools;

/// One row of the statistics dump.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRow {
    pub query_id: u64,
    pub executions_without_model: i64,
    pub executions_with_model: i64,
    pub exec_time_with_model: Vec<f64>,
    pub exec_time: Vec<f64>,
    pub plan_time_with_model: Vec<f64>,
    pub plan_time: Vec<f64>,
    pub est_error_with_model: Vec<f64>,
    pub est_error: Vec<f64>,
}

impl From<&StatEntry> for StatRow {
    fn from(entry: &StatEntry) -> Self {
        let with = &entry.with_model;
        let without = &entry.without_model;
        Self {
            query_id: entry.query_id,
            executions_without_model: without.total,
            executions_with_model: with.total,
            exec_time_with_model: with.exec_times().to_vec(),
            exec_time: without.exec_times().to_vec(),
            plan_time_with_model: with.plan_times().to_vec(),
            plan_time: without.plan_times().to_vec(),
            est_error_with_model: with.est_errors().to_vec(),
            est_error: without.est_errors().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRow {
    pub query_id: u64,
    pub text: String,
}

/// Where a dumped dataset lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Store,
    Cache,
}

/// Summary of one dataset: its key, shape and relations, not the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    pub backend: Backend,
    pub fs: u64,
    pub fss: i32,
    pub cols: i32,
    pub rows: i32,
    pub relations: Vec<RelationId>,
}

impl KnowledgeBase {
    pub fn query_stats(&self) -> Vec<StatRow> {
        self.stats.snapshot_all().iter().map(StatRow::from).collect()
    }

    pub fn query_texts(&self) -> Result<Vec<TextRow>> {
        Ok(self
            .texts
            .all()?
            .into_iter()
            .map(|(query_id, text)| TextRow { query_id, text })
            .collect())
    }

    /// Every dataset of both backends, stored ones first, each ordered by
    /// `(fs, fss)`.
    pub fn datasets(&self) -> Result<Vec<DatasetRow>> {
        let stored = if self.is_enabled() {
            self.tolerate(self.db.datasets(), Vec::new())?
        } else {
            Vec::new()
        };

        let stored = stored
            .into_iter()
            .sorted_by_key(|row| row.key())
            .map(|row| DatasetRow {
                backend: Backend::Store,
                fs: row.fs,
                fss: row.fss,
                cols: row.cols,
                rows: row.rows(),
                relations: row.relations().to_vec(),
            });

        let cached = self.data.entries()?.into_iter().map(|cached| DatasetRow {
            backend: Backend::Cache,
            fs: cached.key.fs,
            fss: cached.key.fss,
            cols: cached.data.cols,
            rows: cached.data.rows,
            relations: cached.relations,
        });

        Ok(stored.chain(cached).collect())
    }

    pub fn remove_query_stat(&self, query_id: u64) -> bool {
        self.stats.remove(query_id)
    }

    pub fn remove_query_text(&self, query_id: u64) -> Result<bool> {
        self.texts.remove_text(query_id)
    }

    pub fn remove_cached_dataset(&self, key: FeatureSubspaceKey) -> Result<bool> {
        self.data.remove(key)
    }
}
