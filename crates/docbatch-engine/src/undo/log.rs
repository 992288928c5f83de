//! Append-only undo log keyed by batch

use chrono::Utc;
use dashmap::DashMap;

use docbatch_core::{BatchId, NodeId, UndoData, UndoEntry, Version};

/// Per-batch compensating records, written by the executor only
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: DashMap<BatchId, Vec<UndoEntry>>,
}

impl UndoLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry and return it with its sequence number
    pub fn append(
        &self,
        batch_id: BatchId,
        target_id: NodeId,
        prior_version: Version,
        overwritten_expectation: Option<Version>,
        data: UndoData,
    ) -> UndoEntry {
        let mut log = self.entries.entry(batch_id).or_default();
        let entry = UndoEntry {
            seq: log.len() as u64,
            target_id,
            prior_version,
            overwritten_expectation,
            data,
            recorded_at: Utc::now(),
        };
        log.push(entry.clone());
        entry
    }

    /// Copy of the batch's entries in append order
    #[must_use]
    pub fn entries(&self, batch_id: &BatchId) -> Vec<UndoEntry> {
        self.entries
            .get(batch_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Number of entries recorded for a batch
    #[must_use]
    pub fn len(&self, batch_id: &BatchId) -> usize {
        self.entries.get(batch_id).map_or(0, |log| log.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_per_batch() {
        let log = UndoLog::new();
        let (a, b) = (BatchId::new(), BatchId::new());
        let data = UndoData::Copied {
            clone_id: NodeId::new("c"),
        };

        assert_eq!(log.append(a, NodeId::new("x"), Version(1), None, data.clone()).seq, 0);
        assert_eq!(log.append(a, NodeId::new("y"), Version(1), None, data.clone()).seq, 1);
        assert_eq!(log.append(b, NodeId::new("z"), Version(1), None, data).seq, 0);
        assert_eq!(log.len(&a), 2);
        assert!(log.entries(&BatchId::new()).is_empty());
    }
}
