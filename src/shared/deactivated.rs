use parking_lot::RwLock;
use std::collections::HashSet;

/// Query classes whose learning has been switched off for this process.
#[derive(Debug, Default)]
pub struct DeactivatedQueries {
    ids: RwLock<HashSet<u64>>,
}

impl DeactivatedQueries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_deactivated(&self, query_id: u64) -> bool {
        self.ids.read().contains(&query_id)
    }

    /// Returns false if the query was already deactivated.
    pub fn deactivate(&self, query_id: u64) -> bool {
        self.ids.write().insert(query_id)
    }

    pub fn clear(&self) {
        self.ids.write().clear();
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}
