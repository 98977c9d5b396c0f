//! Record types shared by the durable store and the shared cache.

use serde::{Deserialize, Serialize};

/// Identifier of a table whose statistics a dataset depends on. `0` is never
/// a valid relation.
pub type RelationId = u32;

/// Number of samples each statistics ring keeps.
pub const STAT_SAMPLE_SIZE: usize = 20;

/// Two-level identity of a dataset: a feature space and a subspace in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureSubspaceKey {
    pub fs: u64,
    pub fss: i32,
}

impl FeatureSubspaceKey {
    pub fn new(fs: u64, fss: i32) -> Self {
        Self { fs, fss }
    }
}

impl std::fmt::Display for FeatureSubspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.fs, self.fss)
    }
}

/// Observations of one feature subspace used by the kNN estimator.
///
/// The matrix is stored row-major with `cols` values per row. A dataset with
/// `cols == 0` has no matrix at all, only targets and reliability factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkNNDataset {
    pub cols: i32,
    pub rows: i32,
    pub matrix: Vec<f64>,
    pub targets: Vec<f64>,
    pub reliability: Vec<f64>,
}

impl OkNNDataset {
    /// Creates an empty dataset with the given number of features.
    pub fn new(cols: i32) -> Self {
        Self {
            cols,
            rows: 0,
            matrix: Vec::new(),
            targets: Vec::new(),
            reliability: Vec::new(),
        }
    }

    /// Placeholder used while merging candidates: `rows < 0` means nothing
    /// has been accepted yet.
    pub(crate) fn unset(cols: i32) -> Self {
        Self {
            rows: -1,
            ..Self::new(cols)
        }
    }

    /// Appends one observation. `features` must hold exactly `cols` values.
    pub fn push_row(&mut self, features: &[f64], target: f64, reliability: f64) {
        debug_assert_eq!(features.len(), self.cols.max(0) as usize);
        self.matrix.extend_from_slice(features);
        self.targets.push(target);
        self.reliability.push(reliability);
        self.rows += 1;
    }

    pub fn row(&self, i: usize) -> &[f64] {
        let cols = self.cols.max(0) as usize;
        &self.matrix[i * cols..(i + 1) * cols]
    }

    pub fn is_empty(&self) -> bool {
        self.rows <= 0
    }

    /// Checks that the vectors agree with `rows` and `cols`.
    pub fn is_consistent(&self) -> bool {
        if self.rows < 0 || self.cols < 0 {
            return false;
        }
        let rows = self.rows as usize;
        self.matrix.len() == rows * self.cols as usize
            && self.targets.len() == rows
            && self.reliability.len() == rows
    }
}

/// Registration of a query class in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRegistration {
    pub query_hash: u64,
    pub learn: bool,
    pub use_model: bool,
    pub fspace_hash: u64,
    pub auto_tuning: bool,
}

/// What the planner learns about a query from its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    pub learn: bool,
    pub use_model: bool,
    pub fspace_hash: u64,
    pub auto_tuning: bool,
    pub collect_stat: bool,
}

impl From<&QueryRegistration> for QueryContext {
    fn from(reg: &QueryRegistration) -> Self {
        Self {
            learn: reg.learn,
            use_model: reg.use_model,
            fspace_hash: reg.fspace_hash,
            auto_tuning: reg.auto_tuning,
            collect_stat: reg.auto_tuning,
        }
    }
}

/// Sliding window of execution samples, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatRing {
    pub plan_time: [f64; STAT_SAMPLE_SIZE],
    pub exec_time: [f64; STAT_SAMPLE_SIZE],
    pub est_error: [f64; STAT_SAMPLE_SIZE],
    pub len: u32,
    pub total: i64,
}

impl Default for StatRing {
    fn default() -> Self {
        Self {
            plan_time: [0.0; STAT_SAMPLE_SIZE],
            exec_time: [0.0; STAT_SAMPLE_SIZE],
            est_error: [0.0; STAT_SAMPLE_SIZE],
            len: 0,
            total: 0,
        }
    }
}

impl StatRing {
    /// Appends a sample. A full ring drops its oldest sample first, so the
    /// physical order stays chronological.
    pub fn push(&mut self, plan_time: f64, exec_time: f64, est_error: f64) {
        let pos = if (self.len as usize) < STAT_SAMPLE_SIZE {
            self.len += 1;
            self.len as usize - 1
        } else {
            self.plan_time.copy_within(1.., 0);
            self.exec_time.copy_within(1.., 0);
            self.est_error.copy_within(1.., 0);
            STAT_SAMPLE_SIZE - 1
        };

        self.plan_time[pos] = plan_time;
        self.exec_time[pos] = exec_time;
        self.est_error[pos] = est_error;
        self.total += 1;
    }

    /// Whether the counters describe a ring this type could have built:
    /// no more samples than slots, and no more kept than ever recorded.
    pub fn is_valid(&self) -> bool {
        self.len as usize <= STAT_SAMPLE_SIZE && self.total >= i64::from(self.len)
    }

    pub fn plan_times(&self) -> &[f64] {
        &self.plan_time[..self.len as usize]
    }

    pub fn exec_times(&self) -> &[f64] {
        &self.exec_time[..self.len as usize]
    }

    pub fn est_errors(&self) -> &[f64] {
        &self.est_error[..self.len as usize]
    }
}

/// Execution statistics of one query class.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatEntry {
    pub query_id: u64,
    /// Executions planned with the adaptive model
    pub with_model: StatRing,
    /// Executions planned without it
    pub without_model: StatRing,
}

impl StatEntry {
    pub fn new(query_id: u64) -> Self {
        Self {
            query_id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_latest_samples() {
        let mut ring = StatRing::default();
        let n = STAT_SAMPLE_SIZE + 5;
        for i in 0..n {
            ring.push(i as f64, i as f64 * 10.0, i as f64 * 0.1);
        }

        assert_eq!(ring.len as usize, STAT_SAMPLE_SIZE);
        assert_eq!(ring.total, n as i64);

        let expected: Vec<f64> = (5..n).map(|i| i as f64).collect();
        assert_eq!(ring.plan_times(), expected.as_slice());
        assert_eq!(ring.exec_times()[0], 50.0);
        assert_eq!(ring.exec_times()[STAT_SAMPLE_SIZE - 1], (n - 1) as f64 * 10.0);
    }

    #[test]
    fn test_ring_partial_fill() {
        let mut ring = StatRing::default();
        ring.push(1.0, 2.0, 3.0);
        ring.push(4.0, 5.0, 6.0);

        assert_eq!(ring.plan_times(), &[1.0, 4.0]);
        assert_eq!(ring.exec_times(), &[2.0, 5.0]);
        assert_eq!(ring.est_errors(), &[3.0, 6.0]);
        assert_eq!(ring.total, 2);
        assert!(ring.is_valid());
    }

    #[test]
    fn test_ring_validity() {
        let mut ring = StatRing::default();
        assert!(ring.is_valid());

        ring.len = STAT_SAMPLE_SIZE as u32 + 1;
        ring.total = 100;
        assert!(!ring.is_valid());

        ring.len = 3;
        ring.total = 2;
        assert!(!ring.is_valid());
    }

    #[test]
    fn test_dataset_rows() {
        let mut ds = OkNNDataset::new(2);
        ds.push_row(&[1.0, 2.0], 0.5, 1.0);
        ds.push_row(&[3.0, 4.0], 0.7, 0.9);

        assert_eq!(ds.rows, 2);
        assert_eq!(ds.row(1), &[3.0, 4.0]);
        assert!(ds.is_consistent());

        ds.targets.pop();
        assert!(!ds.is_consistent());
    }

    #[test]
    fn test_query_context_collects_stat_when_tuning() {
        let reg = QueryRegistration {
            query_hash: 1,
            learn: true,
            use_model: false,
            fspace_hash: 7,
            auto_tuning: true,
        };
        let ctx = QueryContext::from(&reg);
        assert!(ctx.collect_stat);
        assert_eq!(ctx.fspace_hash, 7);
    }
}
