//! Time budgets and transient-failure retries (paused clock)

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use docbatch_core::{
    BatchError, BatchStatus, DocumentNode, ErrorCode, ItemOutcome, NodeId, OperationType, ProjectId,
    RepositoryError, Version,
};
use docbatch_engine::memory::{MemoryBackend, MemoryDocumentRepository};
use docbatch_engine::{BatchCoordinator, BatchQuery, Collaborators, DocumentRepository, Mutation, MutationOutcome};
use docbatch_test_utils::{ids, test_config, Harness};

/// Repository whose reads stall
struct SlowReads {
    inner: Arc<MemoryDocumentRepository>,
    delay: Duration,
}

#[async_trait]
impl DocumentRepository for SlowReads {
    async fn read(&self, id: &NodeId) -> Result<Option<DocumentNode>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(id).await
    }

    async fn children(&self, project_id: &ProjectId, parent: Option<&NodeId>) -> Result<Vec<NodeId>, RepositoryError> {
        self.inner.children(project_id, parent).await
    }

    async fn version(&self, id: &NodeId) -> Result<Option<Version>, RepositoryError> {
        self.inner.version(id).await
    }

    async fn mutate(&self, id: &NodeId, mutation: Mutation) -> Result<MutationOutcome, RepositoryError> {
        self.inner.mutate(id, mutation).await
    }
}

fn docs(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|d| format!("f1-d{d}")).collect()
}

#[tokio::test(start_paused = true)]
async fn test_slow_preflight_times_out() {
    let backend = MemoryBackend::new();
    let project = ProjectId::new("p1");
    backend.repository.seed_project(&project, 1, 3).expect("seed");
    let collaborators = Collaborators {
        repository: Arc::new(SlowReads {
            inner: Arc::clone(&backend.repository),
            delay: Duration::from_secs(1),
        }),
        ..backend.collaborators()
    };
    let coordinator = BatchCoordinator::new(
        test_config().with_preflight_timeout(Duration::from_millis(100)),
        collaborators,
    );

    let request = docbatch_core::SubmitRequest::new(project.clone(), OperationType::Delete, ids(&["f1-d1"]));
    let err = coordinator
        .submit(&docbatch_core::UserId::new("alice"), request)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::PreflightTimeout { budget_ms: 100 }));
    assert!(err.is_submission_error());
    assert!(coordinator.list_batches(&BatchQuery::project(project)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_execution_budget_fails_the_rest() {
    let config = test_config().with_execution_timeout(Duration::from_millis(250));
    let harness = Harness::with_config(config, 2, 10);
    harness.repository().set_latency(Duration::from_millis(100));

    let targets = docs(1..=10);
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    let batch = harness
        .run(
            harness
                .request(OperationType::Move, &targets)
                .with_payload("newParentId", json!("f2")),
        )
        .await;

    assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    assert_eq!(batch.failure.as_ref().map(|f| f.code), Some(ErrorCode::ExecutionTimeout));
    let counts = batch.counts();
    // the third write starts before the deadline and is allowed to finish
    assert_eq!((counts.succeeded, counts.failed), (3, 7));
    assert_eq!(batch.outcome_of(&NodeId::new("f1-d3")), Some(ItemOutcome::Succeeded));
    for result in batch.item_results.iter().skip(3) {
        assert_eq!(result.outcome, ItemOutcome::Failed);
        assert_eq!(result.error, Some(ErrorCode::ExecutionTimeout));
    }
    assert_eq!(harness.repository().mutation_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_reads_fails_item_before_write() {
    let backend = MemoryBackend::new();
    let project = ProjectId::new("p1");
    backend.repository.seed_project(&project, 2, 3).expect("seed");
    let collaborators = Collaborators {
        repository: Arc::new(SlowReads {
            inner: Arc::clone(&backend.repository),
            delay: Duration::from_millis(200),
        }),
        ..backend.collaborators()
    };
    let coordinator = BatchCoordinator::new(
        test_config().with_execution_timeout(Duration::from_millis(250)),
        collaborators,
    );

    let request = docbatch_core::SubmitRequest::new(project.clone(), OperationType::Move, ids(&["f1-d1", "f1-d2", "f1-d3"]))
        .with_payload("newParentId", json!("f2"));
    let response = coordinator
        .submit(&docbatch_core::UserId::new("alice"), request)
        .await
        .expect("accepted");
    let batch = docbatch_test_utils::wait_for_terminal(&coordinator, response.batch_id).await;

    assert_eq!(batch.outcome_of(&NodeId::new("f1-d1")), Some(ItemOutcome::Succeeded));
    let interrupted = batch.result_of(&NodeId::new("f1-d2")).expect("recorded");
    assert_eq!(interrupted.error, Some(ErrorCode::ExecutionTimeout));
    assert!(interrupted.reason.contains("before the write"), "{}", interrupted.reason);
    assert_eq!(backend.repository.mutation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_atomic_timeout_rolls_back() {
    let config = test_config().with_execution_timeout(Duration::from_millis(250));
    let harness = Harness::with_config(config, 2, 5);
    let before = harness.shape();
    harness.repository().set_latency(Duration::from_millis(100));

    let targets = docs(1..=5);
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    let batch = harness
        .run(
            harness
                .request(OperationType::Move, &targets)
                .with_atomic(true)
                .with_payload("newParentId", json!("f2")),
        )
        .await;

    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure.as_ref().map(|f| f.code), Some(ErrorCode::ExecutionTimeout));
    assert_eq!(batch.reversals.len(), 3);
    assert_eq!(harness.shape(), before);
}

/// Repository that applies a write immediately but acknowledges it late
struct SlowAcks {
    inner: Arc<MemoryDocumentRepository>,
    delay: Duration,
}

#[async_trait]
impl DocumentRepository for SlowAcks {
    async fn read(&self, id: &NodeId) -> Result<Option<DocumentNode>, RepositoryError> {
        self.inner.read(id).await
    }

    async fn children(&self, project_id: &ProjectId, parent: Option<&NodeId>) -> Result<Vec<NodeId>, RepositoryError> {
        self.inner.children(project_id, parent).await
    }

    async fn version(&self, id: &NodeId) -> Result<Option<Version>, RepositoryError> {
        self.inner.version(id).await
    }

    async fn mutate(&self, id: &NodeId, mutation: Mutation) -> Result<MutationOutcome, RepositoryError> {
        let outcome = self.inner.mutate(id, mutation).await;
        tokio::time::sleep(self.delay).await;
        outcome
    }
}

#[tokio::test(start_paused = true)]
async fn test_write_landing_at_deadline_is_rolled_back() {
    let backend = MemoryBackend::new();
    let project = ProjectId::new("p1");
    backend.repository.seed_project(&project, 2, 4).expect("seed");
    let before = docbatch_test_utils::tree_shape(&backend.repository, &project);
    let collaborators = Collaborators {
        repository: Arc::new(SlowAcks {
            inner: Arc::clone(&backend.repository),
            delay: Duration::from_millis(100),
        }),
        ..backend.collaborators()
    };
    let coordinator = BatchCoordinator::new(
        test_config().with_execution_timeout(Duration::from_millis(250)),
        collaborators,
    );

    let request = docbatch_core::SubmitRequest::new(project.clone(), OperationType::Move, ids(&["f1-d1", "f1-d2", "f1-d3", "f1-d4"]))
        .with_atomic(true)
        .with_payload("newParentId", json!("f2"));
    let response = coordinator
        .submit(&docbatch_core::UserId::new("alice"), request)
        .await
        .expect("accepted");
    let batch = docbatch_test_utils::wait_for_terminal(&coordinator, response.batch_id).await;

    // f1-d3 is written at 200ms and acknowledged after the 250ms budget
    assert_eq!(batch.outcome_of(&NodeId::new("f1-d3")), Some(ItemOutcome::Succeeded));
    assert_eq!(batch.outcome_of(&NodeId::new("f1-d4")), Some(ItemOutcome::Failed));
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure.as_ref().map(|f| f.code), Some(ErrorCode::ExecutionTimeout));
    assert_eq!(batch.reversals.len(), 3);
    assert!(batch.reversals.iter().all(|r| r.succeeded));
    assert!(batch.undo_failure.is_none());
    assert_eq!(docbatch_test_utils::tree_shape(&backend.repository, &project), before);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new(1, 3);
    harness.repository().fail_transiently(&NodeId::new("f1-d1"), 2);
    harness.repository().fail_transiently(&NodeId::new("f1-d2"), 5);

    let batch = harness
        .run(harness.request(OperationType::Delete, &["f1-d1", "f1-d2", "f1-d3"]))
        .await;

    let recovered = batch.result_of(&NodeId::new("f1-d1")).expect("recorded");
    assert_eq!(recovered.outcome, ItemOutcome::Succeeded);
    assert_eq!(recovered.attempts, 3);
    assert!(recovered.error.is_none());

    let exhausted = batch.result_of(&NodeId::new("f1-d2")).expect("recorded");
    assert_eq!(exhausted.outcome, ItemOutcome::Failed);
    assert_eq!(exhausted.error, Some(ErrorCode::TransientRepositoryError));
    assert_eq!(exhausted.attempts, 3);
    assert!(exhausted.reason.contains("after 3 attempt(s)"), "{}", exhausted.reason);

    assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
}
