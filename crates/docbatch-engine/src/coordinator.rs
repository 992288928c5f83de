//! Batch coordinator
//!
//! Public face of the engine:
//! - `submit`: validate, expand, preflight, persist and hand off to the executor
//! - `get_progress`, `get_batch`, `list_batches`: lock-free reads
//! - `cancel`: flip the batch's cancellation token
//! - `undo`: delegate to the undo manager
//!
//! Submission-time failures create no record. Execution runs on a spawned
//! task; the coordinator keeps only its cancellation token.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;

use docbatch_core::{
    BatchError, BatchEvent, BatchEventKind, BatchId, BatchOperation, BatchProgress, BatchStatus, ConflictPolicy,
    EngineConfig, NewBatch, Operation, PreflightSummary, ProjectId, RetryPolicy, SubmitRequest, TargetList, UserId,
};

use crate::cancel::CancelToken;
use crate::collaborators::Collaborators;
use crate::executor::Executor;
use crate::expander::{check_destination, TargetExpander};
use crate::preflight::PreflightValidator;
use crate::progress::ProgressTracker;
use crate::store::{BatchQuery, BatchStore, MemoryBatchStore};
use crate::undo::{UndoLog, UndoManager};

/// Answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub preflight_summary: PreflightSummary,
    /// The client request ID matched an existing batch, which is returned instead
    pub deduplicated: bool,
}

impl SubmitResponse {
    fn existing(batch: &BatchOperation) -> Self {
        Self {
            batch_id: batch.id,
            status: batch.status,
            preflight_summary: batch.preflight_summary.clone(),
            deduplicated: true,
        }
    }
}

/// Request fields checked and parsed before any collaborator is consulted
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub operation: Operation,
    pub requested: TargetList,
    pub retry: RetryPolicy,
}

/// Shape checks on a submission
///
/// # Errors
/// `Validation` naming the first broken rule.
pub fn validate_request(request: &SubmitRequest, config: &EngineConfig) -> Result<ValidatedRequest, BatchError> {
    if request.target_ids.is_empty() {
        return Err(BatchError::Validation("targetIds must not be empty".to_string()));
    }
    if request.target_ids.iter().any(|id| id.as_str().is_empty()) {
        return Err(BatchError::Validation("targetIds must not contain empty IDs".to_string()));
    }
    let requested = TargetList::new(request.target_ids.iter().cloned());
    if requested.len() > config.max_targets {
        return Err(BatchError::Validation(format!(
            "{} targets exceed the limit of {}",
            requested.len(),
            config.max_targets
        )));
    }
    if request.atomic && request.conflict_policy == ConflictPolicy::SkipConflicts {
        return Err(BatchError::Validation(
            "atomic batches cannot use SkipConflicts".to_string(),
        ));
    }

    let operation = Operation::from_payload(request.op_type, &request.payload).map_err(BatchError::Validation)?;
    let retry = match request.retry {
        Some(retry) => {
            retry
                .validate()
                .map_err(|err| BatchError::Validation(err.to_string()))?;
            retry
        }
        None => config.retry,
    };

    Ok(ValidatedRequest {
        operation,
        requested,
        retry,
    })
}

struct Inner {
    config: EngineConfig,
    collaborators: Collaborators,
    store: Arc<dyn BatchStore>,
    executor: Executor,
    undo: Arc<UndoManager>,
    progress: ProgressTracker,
    tokens: DashMap<BatchId, CancelToken>,
    submissions: DashMap<SubmissionKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Cheaply cloneable handle to one engine instance
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<Inner>,
}

impl BatchCoordinator {
    /// Engine backed by an in-memory batch store
    #[must_use]
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self::with_store(config, collaborators, Arc::new(MemoryBatchStore::new()))
    }

    /// Engine backed by the given batch store
    #[must_use]
    pub fn with_store(config: EngineConfig, collaborators: Collaborators, store: Arc<dyn BatchStore>) -> Self {
        let log = Arc::new(UndoLog::new());
        let undo = Arc::new(UndoManager::new(
            collaborators.clone(),
            Arc::clone(&store),
            Arc::clone(&log),
            config.event_timeout(),
        ));
        let executor = Executor::new(
            config.clone(),
            collaborators.clone(),
            Arc::clone(&store),
            log,
            Arc::clone(&undo),
        );
        let progress = ProgressTracker::new(Arc::clone(&store), config.recent_outcomes);

        Self {
            inner: Arc::new(Inner {
                config,
                collaborators,
                store,
                executor,
                undo,
                progress,
                tokens: DashMap::new(),
                submissions: DashMap::new(),
            }),
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate, preflight and start a batch
    ///
    /// Returns once the batch is `Executing`; execution continues in the
    /// background. A repeated `clientRequestId` returns the live or recently
    /// succeeded batch it first created.
    ///
    /// # Errors
    /// `Validation`, `TargetNotFound`, `PermissionDenied` or
    /// `PreflightTimeout`; collaborator failures during preflight.
    pub async fn submit(&self, user: &UserId, request: SubmitRequest) -> Result<SubmitResponse, BatchError> {
        let span = tracing::info_span!("submit", project = %request.project_id, op = %request.op_type);
        self.submit_inner(user, request).instrument(span).await
    }

    async fn submit_inner(&self, user: &UserId, request: SubmitRequest) -> Result<SubmitResponse, BatchError> {
        let inner = &self.inner;
        let validated = validate_request(&request, &inner.config)?;

        if !inner
            .collaborators
            .permissions
            .can_edit_project(user, &request.project_id)
            .await
        {
            return Err(BatchError::PermissionDenied(format!(
                "{user} may not edit project {}",
                request.project_id
            )));
        }

        // Held until the new record is stored, so concurrent duplicates see it.
        let _submission = match &request.client_request_id {
            Some(key) => {
                let slot = SubmissionSlot::acquire(&inner.submissions, (request.project_id.clone(), key.clone())).await;
                if let Some(existing) = self.reusable(&request.project_id, key) {
                    tracing::info!(batch_id = %existing.id, client_request_id = %key, "duplicate submission");
                    return Ok(SubmitResponse::existing(&existing));
                }
                Some(slot)
            }
            None => None,
        };

        let budget = inner.config.preflight_timeout();
        let (expanded, summary) = tokio::time::timeout(budget, self.preflight(user, &request, &validated))
            .await
            .map_err(|_| BatchError::PreflightTimeout {
                budget_ms: inner.config.preflight_timeout_ms,
            })??;

        let mut batch = BatchOperation::new(NewBatch {
            project_id: request.project_id,
            operation: validated.operation,
            requested: validated.requested,
            expanded,
            atomic: request.atomic,
            conflict_policy: request.conflict_policy,
            expected_versions: request.expected_versions.into_iter().collect(),
            client_request_id: request.client_request_id,
            retry: validated.retry,
            created_by: user.clone(),
        });
        batch.preflight_summary = summary;
        batch.transition(BatchStatus::Preflighted)?;

        let batch_id = batch.id;
        let token = CancelToken::new();
        inner.tokens.insert(batch_id, token.clone());
        let stored = match inner.store.insert(batch) {
            Ok(stored) => stored,
            Err(err) => {
                inner.tokens.remove(&batch_id);
                return Err(err);
            }
        };
        tracing::info!(%batch_id, targets = stored.total(), atomic = stored.atomic, "batch accepted");
        let created = BatchEvent::from_batch(BatchEventKind::Created, &stored);

        let executing = inner
            .store
            .update(&batch_id, &mut |batch| Ok(batch.transition(BatchStatus::Executing)?))?;
        self.spawn_executor(batch_id, token, created);

        Ok(SubmitResponse {
            batch_id,
            status: executing.status,
            preflight_summary: executing.preflight_summary.clone(),
            deduplicated: false,
        })
    }

    async fn preflight(
        &self,
        user: &UserId,
        request: &SubmitRequest,
        validated: &ValidatedRequest,
    ) -> Result<(TargetList, PreflightSummary), BatchError> {
        let inner = &self.inner;
        let repository = inner.collaborators.repository.as_ref();

        let expanded = TargetExpander::new(repository, &request.project_id, inner.config.max_expanded_targets)
            .expand(&validated.requested, request.include_descendants)
            .await?;
        if let Some(placement) = validated.operation.placement() {
            check_destination(repository, &request.project_id, placement, &validated.requested).await?;
        }

        let summary = PreflightValidator::new(&inner.collaborators, inner.config.preflight_concurrency)
            .run(user, &request.project_id, &expanded, &request.expected_versions)
            .await?;
        Ok((expanded, summary))
    }

    fn reusable(&self, project_id: &ProjectId, client_request_id: &str) -> Option<Arc<BatchOperation>> {
        let existing = self
            .inner
            .store
            .find_by_client_request(project_id, client_request_id)?;
        let window = self.inner.config.idempotency_window();
        let reusable = if existing.status.is_terminal() {
            existing.status.is_undoable()
                && existing
                    .completed_at
                    .is_some_and(|at| (Utc::now() - at).to_std().map_or(true, |elapsed| elapsed <= window))
        } else {
            true
        };
        reusable.then_some(existing)
    }

    /// The run task announces the batch first, so `Created` precedes its terminal event
    fn spawn_executor(&self, batch_id: BatchId, token: CancelToken, created: BatchEvent) {
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("batch", %batch_id);
        tokio::spawn(
            async move {
                inner
                    .collaborators
                    .publish(created, inner.config.event_timeout())
                    .await;
                inner.executor.run(batch_id, token).await;
                inner.tokens.remove(&batch_id);
            }
            .instrument(span),
        );
    }

    /// Progress snapshot
    ///
    /// # Errors
    /// `NotFound` for unknown batches.
    pub fn get_progress(&self, batch_id: BatchId) -> Result<BatchProgress, BatchError> {
        self.inner.progress.get(&batch_id)
    }

    /// Full record snapshot
    ///
    /// # Errors
    /// `NotFound` for unknown batches.
    pub fn get_batch(&self, batch_id: BatchId) -> Result<Arc<BatchOperation>, BatchError> {
        self.inner
            .store
            .load(&batch_id)
            .ok_or(BatchError::NotFound(batch_id))
    }

    /// Project batches, newest first
    #[must_use]
    pub fn list_batches(&self, query: &BatchQuery) -> Vec<Arc<BatchOperation>> {
        self.inner.store.list(query)
    }

    /// Request cooperative cancellation
    ///
    /// # Errors
    /// `NotFound` for unknown batches, `InvalidState` unless the batch is
    /// `Preflighted` or `Executing`.
    pub fn cancel(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let batch = self.get_batch(batch_id)?;
        if !batch.status.is_cancellable() {
            return Err(BatchError::InvalidState {
                batch_id,
                status: batch.status,
                action: "cancel",
            });
        }
        if let Some(token) = self.inner.tokens.get(&batch_id) {
            token.cancel();
        }
        tracing::info!(%batch_id, "cancellation requested");
        Ok(())
    }

    /// Reverse a finished batch
    ///
    /// # Errors
    /// See [`UndoManager::undo`].
    pub async fn undo(&self, user: &UserId, batch_id: BatchId) -> Result<Arc<BatchOperation>, BatchError> {
        self.inner
            .undo
            .undo(user, batch_id)
            .instrument(tracing::info_span!("undo", %batch_id))
            .await
    }
}

type SubmissionKey = (ProjectId, String);

/// Exclusive hold on one idempotency key; the map entry goes away with the
/// last holder
struct SubmissionSlot<'a> {
    slots: &'a DashMap<SubmissionKey, Arc<tokio::sync::Mutex<()>>>,
    key: SubmissionKey,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl<'a> SubmissionSlot<'a> {
    async fn acquire(slots: &'a DashMap<SubmissionKey, Arc<tokio::sync::Mutex<()>>>, key: SubmissionKey) -> Self {
        let lock = Arc::clone(slots.entry(key.clone()).or_default().value());
        let guard = lock.lock_owned().await;
        Self {
            slots,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for SubmissionSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.slots.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("config", &self.inner.config)
            .field("running", &self.inner.tokens.len())
            .finish_non_exhaustive()
    }
}
