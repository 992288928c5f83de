//! Testing utilities for the docbatch workspace
//!
//! A seeded in-memory engine plus helpers for waiting on batches and
//! comparing tree shapes.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use docbatch_core::{
    BatchEventKind, BatchId, BatchOperation, EngineConfig, NodeId, OperationType, ProjectId, RetryPolicy,
    SubmitRequest, UserId,
};
use docbatch_engine::memory::{MemoryBackend, MemoryDocumentRepository, SeededTree};
use docbatch_engine::{BatchCoordinator, SubmitResponse};

/// Upper bound on how long helpers wait for a batch
pub const WAIT_LIMIT: Duration = Duration::from_secs(30);

/// Engine wired to fresh in-memory collaborators and a seeded project
#[derive(Debug, Clone)]
pub struct Harness {
    pub backend: MemoryBackend,
    pub coordinator: BatchCoordinator,
    pub user: UserId,
    pub project: ProjectId,
    pub tree: SeededTree,
}

impl Harness {
    /// `folders` root folders with `docs_per_folder` documents each
    pub fn new(folders: usize, docs_per_folder: usize) -> Self {
        Self::with_config(test_config(), folders, docs_per_folder)
    }

    pub fn with_config(config: EngineConfig, folders: usize, docs_per_folder: usize) -> Self {
        let backend = MemoryBackend::new();
        let project = ProjectId::new("p1");
        let tree = backend
            .repository
            .seed_project(&project, folders, docs_per_folder)
            .expect("seed project");
        let coordinator = BatchCoordinator::new(config, backend.collaborators());
        Self {
            backend,
            coordinator,
            user: UserId::new("alice"),
            project,
            tree,
        }
    }

    pub fn repository(&self) -> &MemoryDocumentRepository {
        &self.backend.repository
    }

    pub fn request(&self, op: OperationType, targets: &[&str]) -> SubmitRequest {
        SubmitRequest::new(self.project.clone(), op, ids(targets))
    }

    /// Submit, panicking on submission errors
    pub async fn submit(&self, request: SubmitRequest) -> SubmitResponse {
        self.coordinator
            .submit(&self.user, request)
            .await
            .expect("submission accepted")
    }

    /// Submit and wait for a terminal status
    pub async fn run(&self, request: SubmitRequest) -> Arc<BatchOperation> {
        let response = self.submit(request).await;
        self.wait(response.batch_id).await
    }

    pub async fn wait(&self, batch_id: BatchId) -> Arc<BatchOperation> {
        wait_for_terminal(&self.coordinator, batch_id).await
    }

    /// Rows describing the live tree, see [`tree_shape`]
    pub fn shape(&self) -> Vec<String> {
        tree_shape(self.repository(), &self.project)
    }

    /// Event kinds published for a batch so far
    pub fn events(&self, batch_id: &BatchId) -> Vec<BatchEventKind> {
        self.backend.events.kinds(batch_id)
    }
}

/// Default engine config with fast retries
pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy::default().with_initial_backoff_ms(1))
}

pub fn ids(raw: &[&str]) -> Vec<NodeId> {
    raw.iter().map(|id| NodeId::new(*id)).collect()
}

/// Poll until the batch reaches a terminal status
pub async fn wait_for_terminal(coordinator: &BatchCoordinator, batch_id: BatchId) -> Arc<BatchOperation> {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let batch = coordinator.get_batch(batch_id).expect("batch exists");
            if batch.status.is_terminal() {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("batch finished in time")
}

/// Poll until an event of `kind` has been published for the batch
pub async fn wait_for_event(backend: &MemoryBackend, batch_id: BatchId, kind: BatchEventKind) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !backend.events.kinds(&batch_id).contains(&kind) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("event published in time");
}

/// One row per live node in pre-order: `parent/id@position`
///
/// Root-level nodes use `-` as parent.
pub fn tree_shape(repository: &MemoryDocumentRepository, project: &ProjectId) -> Vec<String> {
    repository
        .snapshot(project)
        .into_iter()
        .map(|node| {
            let parent = node.parent_id.as_ref().map_or("-", NodeId::as_str).to_string();
            format!("{parent}/{}@{}", node.id, node.position)
        })
        .collect()
}
