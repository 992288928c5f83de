//! Injected batch record store
//!
//! Readers get an immutable `Arc<BatchOperation>` snapshot and never wait on
//! writers. Writers are serialized per batch and publish a fresh snapshot
//! only when their update succeeds, so a failed update leaves no trace.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use docbatch_core::{BatchError, BatchId, BatchOperation, BatchStatus, OperationType, ProjectId};

/// Filter for `BatchStore::list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchQuery {
    pub project_id: ProjectId,
    #[serde(default)]
    pub status: Option<BatchStatus>,
    #[serde(default, rename = "type")]
    pub op_type: Option<OperationType>,
    #[serde(default = "BatchQuery::default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl BatchQuery {
    /// All batches of a project, first page
    #[must_use]
    pub fn project(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: project_id.into(),
            status: None,
            op_type: None,
            limit: Self::default_limit(),
            offset: 0,
        }
    }

    /// With status filter
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// With type filter
    #[inline]
    #[must_use]
    pub fn with_type(mut self, op_type: OperationType) -> Self {
        self.op_type = Some(op_type);
        self
    }

    /// With page window
    #[inline]
    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    fn default_limit() -> usize {
        50
    }

    fn matches(&self, batch: &BatchOperation) -> bool {
        batch.project_id == self.project_id
            && self.status.map_or(true, |s| s == batch.status)
            && self.op_type.map_or(true, |t| t == batch.op_type)
    }
}

/// Mutation applied to a batch record under the store's per-batch writer lock
pub type RecordUpdate<'a> = &'a mut dyn FnMut(&mut BatchOperation) -> Result<(), BatchError>;

/// Persistence of batch records
pub trait BatchStore: Send + Sync {
    /// Persist a new record
    ///
    /// # Errors
    /// Fails if a record with the same ID exists.
    fn insert(&self, batch: BatchOperation) -> Result<Arc<BatchOperation>, BatchError>;

    /// Latest snapshot
    fn load(&self, id: &BatchId) -> Option<Arc<BatchOperation>>;

    /// Apply `update` to a copy of the record and publish it if it succeeds
    ///
    /// # Errors
    /// `NotFound` for unknown IDs, otherwise whatever `update` returns.
    fn update(&self, id: &BatchId, update: RecordUpdate<'_>) -> Result<Arc<BatchOperation>, BatchError>;

    /// Newest batch submitted with this idempotency key
    fn find_by_client_request(&self, project_id: &ProjectId, client_request_id: &str) -> Option<Arc<BatchOperation>>;

    /// Project batches, newest first
    fn list(&self, query: &BatchQuery) -> Vec<Arc<BatchOperation>>;
}

struct Slot {
    current: ArcSwap<BatchOperation>,
    writer: Mutex<()>,
}

/// In-process store backed by `DashMap` and `ArcSwap`
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: DashMap<BatchId, Arc<Slot>>,
    client_requests: DashMap<(ProjectId, String), BatchId>,
}

impl MemoryBatchStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether the store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn slot(&self, id: &BatchId) -> Option<Arc<Slot>> {
        self.batches.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

impl std::fmt::Debug for MemoryBatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBatchStore")
            .field("batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl BatchStore for MemoryBatchStore {
    fn insert(&self, batch: BatchOperation) -> Result<Arc<BatchOperation>, BatchError> {
        let id = batch.id;
        let key = batch
            .client_request_id
            .clone()
            .map(|key| (batch.project_id.clone(), key));
        let snapshot = Arc::new(batch);

        match self.batches.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BatchError::Store(format!("batch {id} already exists")));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Slot {
                    current: ArcSwap::new(Arc::clone(&snapshot)),
                    writer: Mutex::new(()),
                }));
            }
        }
        if let Some(key) = key {
            self.client_requests.insert(key, id);
        }
        Ok(snapshot)
    }

    fn load(&self, id: &BatchId) -> Option<Arc<BatchOperation>> {
        self.slot(id).map(|slot| slot.current.load_full())
    }

    fn update(&self, id: &BatchId, update: RecordUpdate<'_>) -> Result<Arc<BatchOperation>, BatchError> {
        let slot = self.slot(id).ok_or(BatchError::NotFound(*id))?;
        let _writer = slot.writer.lock();

        let mut next = BatchOperation::clone(&slot.current.load());
        update(&mut next)?;
        let next = Arc::new(next);
        slot.current.store(Arc::clone(&next));
        Ok(next)
    }

    fn find_by_client_request(&self, project_id: &ProjectId, client_request_id: &str) -> Option<Arc<BatchOperation>> {
        let id = *self
            .client_requests
            .get(&(project_id.clone(), client_request_id.to_string()))?
            .value();
        self.load(&id)
    }

    fn list(&self, query: &BatchQuery) -> Vec<Arc<BatchOperation>> {
        let mut matching: Vec<Arc<BatchOperation>> = self
            .batches
            .iter()
            .map(|entry| entry.value().current.load_full())
            .filter(|batch| query.matches(batch))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        matching.into_iter().skip(query.offset).take(query.limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbatch_core::{ConflictPolicy, NewBatch, NodeId, Operation, RetryPolicy, TargetList, UserId};

    fn record(project: &str, key: Option<&str>) -> BatchOperation {
        let targets = TargetList::new(vec![NodeId::new("a")]);
        BatchOperation::new(NewBatch {
            project_id: ProjectId::new(project),
            operation: Operation::Delete,
            requested: targets.clone(),
            expanded: targets,
            atomic: false,
            conflict_policy: ConflictPolicy::FailFast,
            expected_versions: im::HashMap::new(),
            client_request_id: key.map(str::to_string),
            retry: RetryPolicy::default(),
            created_by: UserId::new("u"),
        })
    }

    #[test]
    fn failed_update_publishes_nothing() {
        let store = MemoryBatchStore::new();
        let id = store.insert(record("p", None)).unwrap().id;

        let result = store.update(&id, &mut |batch| {
            batch.transition(BatchStatus::Preflighted)?;
            batch.transition(BatchStatus::Completed)?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.load(&id).unwrap().status, BatchStatus::Preflighting);
    }

    #[test]
    fn old_snapshots_stay_unchanged() {
        let store = MemoryBatchStore::new();
        let id = store.insert(record("p", None)).unwrap().id;
        let before = store.load(&id).unwrap();

        store
            .update(&id, &mut |batch| Ok(batch.transition(BatchStatus::Preflighted)?))
            .unwrap();

        assert_eq!(before.status, BatchStatus::Preflighting);
        assert_eq!(store.load(&id).unwrap().status, BatchStatus::Preflighted);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = MemoryBatchStore::new();
        let batch = record("p", None);
        store.insert(batch.clone()).unwrap();
        assert!(matches!(store.insert(batch), Err(BatchError::Store(_))));
    }

    #[test]
    fn client_request_lookup_is_scoped_by_project() {
        let store = MemoryBatchStore::new();
        let id = store.insert(record("p1", Some("req"))).unwrap().id;

        assert_eq!(store.find_by_client_request(&ProjectId::new("p1"), "req").unwrap().id, id);
        assert!(store.find_by_client_request(&ProjectId::new("p2"), "req").is_none());
    }

    #[test]
    fn list_filters_and_pages() {
        let store = MemoryBatchStore::new();
        for _ in 0..3 {
            store.insert(record("p", None)).unwrap();
        }
        store.insert(record("other", None)).unwrap();

        let all = store.list(&BatchQuery::project("p"));
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let page = store.list(&BatchQuery::project("p").page(2, 1));
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, all[1].id);

        let none = store.list(&BatchQuery::project("p").with_status(BatchStatus::Undone));
        assert!(none.is_empty());
    }
}
