//! Progress snapshots for pollers
//!
//! Reads go straight to the store's latest published snapshot and never
//! wait on the executor.

use std::sync::Arc;

use docbatch_core::{BatchError, BatchId, BatchProgress};

use crate::store::BatchStore;

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn BatchStore>,
    recent: usize,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(store: Arc<dyn BatchStore>, recent: usize) -> Self {
        Self { store, recent }
    }

    /// Current status, counts and the last few outcomes
    ///
    /// # Errors
    /// `NotFound` for unknown batch IDs.
    pub fn get(&self, batch_id: &BatchId) -> Result<BatchProgress, BatchError> {
        self.store
            .load(batch_id)
            .map(|batch| batch.progress(self.recent))
            .ok_or(BatchError::NotFound(*batch_id))
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("recent", &self.recent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBatchStore;

    #[test]
    fn unknown_batch_is_not_found() {
        let tracker = ProgressTracker::new(Arc::new(MemoryBatchStore::new()), 5);
        let id = BatchId::new();
        assert!(matches!(tracker.get(&id), Err(BatchError::NotFound(missing)) if missing == id));
    }
}
