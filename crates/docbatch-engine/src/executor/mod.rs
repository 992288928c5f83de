//! Asynchronous batch executor
//!
//! Applies the operation to each expanded target, records one outcome per
//! target and one undo entry per applied mutation, and finally settles the
//! batch status. Cancellation is polled between items; the overall run is
//! bounded by a deadline.

mod mutation;

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

use docbatch_core::{
    BatchError, BatchEvent, BatchEventKind, BatchFailure, BatchId, BatchOperation, BatchStatus, DocumentNode,
    EngineConfig, ErrorCode, ItemOutcome, ItemResult, NodeId, RepositoryError, ReversalKind, UndoFailure, Version,
};

use crate::cancel::CancelToken;
use crate::collaborators::Collaborators;
use crate::conflict::{resolve, Conflict, Resolution};
use crate::retry::retry_transient;
use crate::store::BatchStore;
use crate::undo::{UndoLog, UndoManager};

use mutation::{ItemMutator, Prepared, Slot};

/// Why a run stopped before reaching the end of the target list
#[derive(Debug, Clone, PartialEq, Eq)]
enum Halt {
    Abort {
        target: NodeId,
        code: ErrorCode,
        reason: String,
    },
    Cancelled,
    TimedOut,
}

/// One processed item and its side effects on the run
#[derive(Debug)]
struct ItemStep {
    result: ItemResult,
    halt: Option<Halt>,
    cloned: Option<NodeId>,
    placed_root: bool,
    /// Descendant targets moved along with this item, with any overwritten expectation
    carried: Vec<(NodeId, Option<Version>)>,
}

impl ItemStep {
    fn done(result: ItemResult) -> Self {
        Self {
            result,
            halt: None,
            cloned: None,
            placed_root: false,
            carried: Vec::new(),
        }
    }

    fn halting(result: ItemResult, halt: Halt) -> Self {
        Self {
            halt: Some(halt),
            ..Self::done(result)
        }
    }
}

/// Run-local state for sequential (Move/Copy) processing
#[derive(Debug, Default)]
struct RunState {
    outcomes: HashMap<NodeId, (ItemOutcome, Option<ErrorCode>)>,
    clones: HashMap<NodeId, NodeId>,
    carried: HashMap<NodeId, Option<Version>>,
    placed_roots: usize,
}

/// Result of the pre-write phase of one item
#[derive(Debug)]
enum Inspection {
    Done(ItemStep),
    Ready(Ready),
}

#[derive(Debug)]
struct Ready {
    node: DocumentNode,
    slot: Slot,
    prepared: Prepared,
    overwritten: Option<Overwrite>,
    carried: Vec<(NodeId, Option<Version>)>,
}

/// Version mismatch ignored under `ForceOverwrite`
#[derive(Debug, Clone, Copy)]
struct Overwrite {
    expected: Version,
    actual: Version,
}

/// Why a node may not be mutated
#[derive(Debug)]
struct Refusal {
    outcome: ItemOutcome,
    code: ErrorCode,
    reason: String,
    aborts: bool,
}

impl Refusal {
    fn failed(code: ErrorCode, reason: String) -> Self {
        Self {
            outcome: ItemOutcome::Failed,
            code,
            reason,
            aborts: false,
        }
    }

    /// Result for `id`; a refusal on a carried descendant is charged to its moving ancestor
    fn into_step(self, id: &NodeId, descendant: Option<&NodeId>) -> ItemStep {
        let reason = match descendant {
            Some(descendant) => format!("descendant {descendant}: {}", self.reason),
            None => self.reason,
        };
        let result = ItemResult::unsuccessful(id.clone(), self.outcome, Some(self.code), reason.clone(), 0);
        if self.aborts {
            ItemStep::halting(
                result,
                Halt::Abort {
                    target: id.clone(),
                    code: self.code,
                    reason,
                },
            )
        } else {
            ItemStep::done(result)
        }
    }
}

/// Background worker for one batch at a time
pub struct Executor {
    config: EngineConfig,
    collaborators: Collaborators,
    store: Arc<dyn BatchStore>,
    log: Arc<UndoLog>,
    undo: Arc<UndoManager>,
}

impl Executor {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        store: Arc<dyn BatchStore>,
        log: Arc<UndoLog>,
        undo: Arc<UndoManager>,
    ) -> Self {
        Self {
            config,
            collaborators,
            store,
            log,
            undo,
        }
    }

    /// Execute a batch that is in `Executing` until it reaches a terminal status
    pub async fn run(&self, batch_id: BatchId, token: CancelToken) {
        if let Err(err) = self.execute(batch_id, &token).await {
            tracing::error!(%batch_id, error = %err, "executor stopped");
        }
    }

    async fn execute(&self, batch_id: BatchId, token: &CancelToken) -> Result<(), BatchError> {
        let batch = self.store.load(&batch_id).ok_or(BatchError::NotFound(batch_id))?;
        let deadline = Instant::now() + self.config.execution_timeout();
        let mutator = ItemMutator::for_operation(&batch.operation);

        tracing::info!(
            targets = batch.total(),
            atomic = batch.atomic,
            policy = ?batch.conflict_policy,
            "execution started"
        );

        let halt = if mutator.is_order_independent() && !batch.atomic && self.config.max_parallel > 1 {
            self.run_grouped(&batch, &mutator, token, deadline).await?
        } else {
            self.run_sequential(&batch, &mutator, token, deadline).await?
        };
        self.finish(batch_id, halt).await
    }

    async fn run_sequential(
        &self,
        batch: &BatchOperation,
        mutator: &ItemMutator,
        token: &CancelToken,
        deadline: Instant,
    ) -> Result<Option<Halt>, BatchError> {
        let mut run = RunState::default();

        for id in &batch.expanded_target_ids {
            if token.is_cancelled() {
                return Ok(Some(Halt::Cancelled));
            }
            if Instant::now() >= deadline {
                return Ok(Some(Halt::TimedOut));
            }

            let step = self.process(batch, mutator, id, &run, deadline).await;
            self.record(batch.id, &step.result)?;

            run.outcomes
                .insert(id.clone(), (step.result.outcome, step.result.error));
            if let Some(clone_id) = step.cloned {
                run.clones.insert(id.clone(), clone_id);
            }
            if step.placed_root {
                run.placed_roots += 1;
            }
            run.carried.extend(step.carried);

            if let Some(halt) = step.halt {
                return Ok(Some(halt));
            }
            if batch.atomic && step.result.outcome != ItemOutcome::Succeeded {
                return Ok(Some(Halt::Abort {
                    target: id.clone(),
                    code: step.result.error.unwrap_or(ErrorCode::RepositoryError),
                    reason: step.result.reason.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Bounded-parallel groups for order-independent, non-atomic batches
    async fn run_grouped(
        &self,
        batch: &BatchOperation,
        mutator: &ItemMutator,
        token: &CancelToken,
        deadline: Instant,
    ) -> Result<Option<Halt>, BatchError> {
        let run = RunState::default();
        let targets = batch.expanded_target_ids.as_slice();

        for group in targets.chunks(self.config.max_parallel) {
            if token.is_cancelled() {
                return Ok(Some(Halt::Cancelled));
            }
            if Instant::now() >= deadline {
                return Ok(Some(Halt::TimedOut));
            }

            let steps = join_all(
                group
                    .iter()
                    .map(|id| self.process(batch, mutator, id, &run, deadline)),
            )
            .await;

            let mut halt = None;
            for step in steps {
                self.record(batch.id, &step.result)?;
                if halt.is_none() {
                    halt = step.halt;
                }
            }
            if halt.is_some() {
                return Ok(halt);
            }
        }
        Ok(None)
    }

    /// Inspect within the deadline, then issue the write
    ///
    /// Once the mutation is issued it runs to its own completion or failure;
    /// only retry backoff is cut short by the deadline.
    async fn process(
        &self,
        batch: &BatchOperation,
        mutator: &ItemMutator,
        id: &NodeId,
        run: &RunState,
        deadline: Instant,
    ) -> ItemStep {
        let ready = match tokio::time::timeout_at(deadline, self.inspect(batch, mutator, id, run, deadline)).await {
            Ok(Inspection::Done(step)) => return step,
            Ok(Inspection::Ready(ready)) => ready,
            Err(_) => {
                return ItemStep::halting(
                    ItemResult::unsuccessful(
                        id.clone(),
                        ItemOutcome::Failed,
                        Some(ErrorCode::ExecutionTimeout),
                        "execution time budget exhausted mid-item, before the write",
                        1,
                    ),
                    Halt::TimedOut,
                )
            }
        };
        let Ready {
            node,
            slot,
            prepared,
            overwritten,
            carried,
        } = ready;

        let repository = &self.collaborators.repository;
        let applied = retry_transient(&batch.retry, Some(deadline), || {
            repository.mutate(id, prepared.mutation.clone())
        })
        .await;
        let attempts = applied.attempts;
        let outcome = match applied.result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(node = %id, attempts, error = %err, "mutation failed");
                return failed(id, repository_code(&err), format!("{err} after {attempts} attempt(s)"), attempts);
            }
        };

        let undo_data = match prepared.into_undo(&outcome) {
            Ok(data) => data,
            Err(err) => return failed(id, ErrorCode::RepositoryError, err.to_string(), attempts),
        };
        let expected = overwritten.map(|o| o.expected);
        self.log
            .append(batch.id, id.clone(), node.version, expected, undo_data.clone());

        let reason = match overwritten {
            Some(o) => format!("{} (overwrote expected {}, was {})", mutator.verb(), o.expected, o.actual),
            None => mutator.verb().to_string(),
        };
        ItemStep {
            result: ItemResult::succeeded(id.clone(), reason, Some(undo_data), attempts),
            halt: None,
            cloned: outcome.created.clone(),
            placed_root: matches!(slot, Slot::Root { .. }),
            carried,
        }
    }

    /// Everything before the write: read, placement, checks, undo capture
    async fn inspect(
        &self,
        batch: &BatchOperation,
        mutator: &ItemMutator,
        id: &NodeId,
        run: &RunState,
        deadline: Instant,
    ) -> Inspection {
        let repository = &self.collaborators.repository;
        let read = retry_transient(&batch.retry, Some(deadline), || repository.read(id)).await;
        let node = match read.result {
            Ok(Some(node)) if node.project_id == batch.project_id => node,
            Ok(_) => {
                return Inspection::Done(failed(
                    id,
                    ErrorCode::TargetNotFound,
                    format!("{id} no longer exists"),
                    read.attempts,
                ))
            }
            Err(err) => return Inspection::Done(failed(id, repository_code(&err), err.to_string(), read.attempts)),
        };

        let mut slot = Slot::Root {
            ordinal: run.placed_roots,
        };
        if mutator.follows_parent() {
            let tracked_parent = node
                .parent_id
                .as_ref()
                .and_then(|parent| run.outcomes.get(parent).map(|outcome| (parent, outcome)));
            if let Some((parent, (outcome, code))) = tracked_parent {
                if *outcome != ItemOutcome::Succeeded {
                    return Inspection::Done(ItemStep::done(ItemResult::unsuccessful(
                        id.clone(),
                        ItemOutcome::Skipped,
                        *code,
                        format!("parent {parent} was not {}", mutator.verb()),
                        0,
                    )));
                }
                match (mutator, run.clones.get(parent)) {
                    (ItemMutator::Move(_), _) => {
                        // Admitted when the parent checked its subtree
                        let reason = match run.carried.get(id).copied().flatten() {
                            Some(expected) => format!("moved with parent {parent} (overwrote expected {expected})"),
                            None => format!("moved with parent {parent}"),
                        };
                        return Inspection::Done(ItemStep::done(ItemResult::succeeded(id.clone(), reason, None, 0)));
                    }
                    (_, Some(clone_parent)) => slot = Slot::UnderClone(clone_parent.clone()),
                    (_, None) => {}
                }
            }
        }

        let overwritten = match self.admit(batch, id, deadline).await {
            Ok(overwritten) => overwritten,
            Err(refusal) => return Inspection::Done(refusal.into_step(id, None)),
        };

        let mut carried = Vec::new();
        if mutator.carries_subtree() && node.kind.is_container() {
            let descendants = match self.carried_targets(batch, id).await {
                Ok(descendants) => descendants,
                Err(err) => return Inspection::Done(failed(id, repository_code(&err), err.to_string(), 0)),
            };
            for descendant in descendants {
                match self.admit(batch, &descendant, deadline).await {
                    Ok(admitted) => carried.push((descendant, admitted.map(|o| o.expected))),
                    Err(refusal) => return Inspection::Done(refusal.into_step(id, Some(&descendant))),
                }
            }
        }

        match mutator.prepare(repository.as_ref(), &node, &slot).await {
            Ok(prepared) => Inspection::Ready(Ready {
                node,
                slot,
                prepared,
                overwritten,
                carried,
            }),
            Err(err) => Inspection::Done(failed(id, repository_code(&err), err.to_string(), 0)),
        }
    }

    /// Permission, editing lock and expected version of one node, resolved by policy
    async fn admit(&self, batch: &BatchOperation, id: &NodeId, deadline: Instant) -> Result<Option<Overwrite>, Refusal> {
        if !self.collaborators.permissions.can_mutate(&batch.created_by, id).await {
            return Err(Refusal::failed(
                ErrorCode::PermissionDenied,
                format!("{} may not modify {id}", batch.created_by),
            ));
        }

        let conflict = match self.collaborators.foreign_lock(id, &batch.created_by).await {
            Ok(Some(owner)) => Some(Conflict::Lock { owner }),
            Ok(None) => match batch.expected_versions.get(id) {
                None => None,
                Some(expected) => {
                    let repository = &self.collaborators.repository;
                    let oracle = retry_transient(&batch.retry, Some(deadline), || repository.version(id)).await;
                    match oracle.result {
                        Ok(Some(actual)) if actual == *expected => None,
                        Ok(Some(actual)) => Some(Conflict::Version {
                            expected: *expected,
                            actual,
                        }),
                        Ok(None) => {
                            return Err(Refusal::failed(ErrorCode::TargetNotFound, format!("{id} no longer exists")))
                        }
                        Err(err) => return Err(Refusal::failed(repository_code(&err), err.to_string())),
                    }
                }
            },
            Err(err) => return Err(Refusal::failed(ErrorCode::RepositoryError, err.to_string())),
        };
        let actual = match &conflict {
            Some(Conflict::Version { actual, .. }) => Some(*actual),
            _ => None,
        };

        match resolve(batch.conflict_policy, conflict) {
            Resolution::Proceed { overwritten } => Ok(overwritten.zip(actual).map(|(expected, actual)| Overwrite {
                expected,
                actual,
            })),
            Resolution::Skip(conflict) => {
                tracing::debug!(node = %id, conflict = %conflict.describe(), "skipping conflicted item");
                Err(Refusal {
                    outcome: ItemOutcome::Skipped,
                    code: conflict.code(),
                    reason: conflict.describe(),
                    aborts: false,
                })
            }
            Resolution::Reject(conflict) => Err(Refusal::failed(conflict.code(), conflict.describe())),
            Resolution::Abort(conflict) => {
                tracing::warn!(node = %id, conflict = %conflict.describe(), "conflict aborts batch");
                Err(Refusal {
                    outcome: ItemOutcome::Failed,
                    code: conflict.code(),
                    reason: conflict.describe(),
                    aborts: true,
                })
            }
        }
    }

    /// Expanded targets inside the subtree of `root`, in pre-order
    async fn carried_targets(&self, batch: &BatchOperation, root: &NodeId) -> Result<Vec<NodeId>, RepositoryError> {
        let repository = &self.collaborators.repository;
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = repository
            .children(&batch.project_id, Some(root))
            .await?
            .into_iter()
            .rev()
            .collect();
        while let Some(id) = stack.pop() {
            if batch.expanded_target_ids.contains(&id) {
                found.push(id.clone());
            }
            let children = repository.children(&batch.project_id, Some(&id)).await?;
            stack.extend(children.into_iter().rev());
        }
        Ok(found)
    }

    fn record(&self, batch_id: BatchId, result: &ItemResult) -> Result<(), BatchError> {
        if result.outcome == ItemOutcome::Failed {
            tracing::warn!(node = %result.target_id, code = ?result.error, reason = %result.reason, "item failed");
        }
        self.store
            .update(&batch_id, &mut |batch| Ok(batch.record_item(result.clone())?))?;
        Ok(())
    }

    async fn finish(&self, batch_id: BatchId, halt: Option<Halt>) -> Result<(), BatchError> {
        let current = self.store.load(&batch_id).ok_or(BatchError::NotFound(batch_id))?;

        let remainder = match &halt {
            None => None,
            Some(Halt::Cancelled) => Some((ItemOutcome::Cancelled, ErrorCode::Cancelled, "cancelled before processing".to_string())),
            Some(Halt::TimedOut) => Some((
                ItemOutcome::Failed,
                ErrorCode::ExecutionTimeout,
                "execution time budget exhausted".to_string(),
            )),
            Some(Halt::Abort { target, code, .. }) => {
                Some((ItemOutcome::Skipped, *code, format!("not attempted: batch aborted at {target}")))
            }
        };

        let reversals = if current.atomic && halt.is_some() {
            self.undo.rollback(&current).await
        } else {
            Vec::new()
        };
        let rollback_failures: Vec<NodeId> = reversals
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| r.target_id.clone())
            .collect();

        let failure = match &halt {
            Some(Halt::Abort { target, code, reason }) => Some(BatchFailure {
                code: *code,
                message: format!("aborted at {target}: {reason}"),
            }),
            Some(Halt::TimedOut) => Some(BatchFailure {
                code: ErrorCode::ExecutionTimeout,
                message: format!("exceeded {}ms", self.config.execution_timeout_ms),
            }),
            Some(Halt::Cancelled) | None => None,
        };

        let updated = self.store.update(&batch_id, &mut |batch| {
            if let Some((outcome, code, reason)) = &remainder {
                let pending: Vec<NodeId> = batch.unprocessed().cloned().collect();
                for id in pending {
                    batch.record_item(ItemResult::unsuccessful(id, *outcome, Some(*code), reason.clone(), 0))?;
                }
            }
            for reversal in &reversals {
                batch.record_reversal(reversal.clone())?;
            }
            if !rollback_failures.is_empty() {
                batch.annotate_undo_failure(Some(UndoFailure {
                    kind: ReversalKind::Rollback,
                    failed_targets: rollback_failures.clone(),
                    message: format!("rollback left {} item(s) applied", rollback_failures.len()),
                    at: chrono::Utc::now(),
                }))?;
            }

            let status = match &halt {
                Some(Halt::Cancelled) => BatchStatus::Cancelled,
                Some(_) if batch.atomic => BatchStatus::Failed,
                _ => batch.counts().settled_status(),
            };
            let settled_failure = match &failure {
                Some(failure) => Some(failure.clone()),
                None if status == BatchStatus::Failed => Some(BatchFailure {
                    code: first_error(batch).unwrap_or(ErrorCode::RepositoryError),
                    message: "no item could be applied".to_string(),
                }),
                None => None,
            };
            batch.failure = settled_failure;
            batch.transition(status)?;
            Ok(())
        })?;

        let counts = updated.counts();
        tracing::info!(
            status = ?updated.status,
            succeeded = counts.succeeded,
            skipped = counts.skipped,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "execution finished"
        );

        if let Some(kind) = BatchEventKind::for_status(updated.status) {
            self.collaborators
                .publish(BatchEvent::from_batch(kind, &updated), self.config.event_timeout())
                .await;
        }
        if !rollback_failures.is_empty() {
            tracing::warn!(failed = rollback_failures.len(), "rollback incomplete");
            self.collaborators
                .publish(BatchEvent::from_batch(BatchEventKind::UndoFailed, &updated), self.config.event_timeout())
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn failed(id: &NodeId, code: ErrorCode, reason: String, attempts: u32) -> ItemStep {
    ItemStep::done(ItemResult::unsuccessful(
        id.clone(),
        ItemOutcome::Failed,
        Some(code),
        reason,
        attempts,
    ))
}

fn repository_code(err: &RepositoryError) -> ErrorCode {
    match err {
        RepositoryError::Transient(_) => ErrorCode::TransientRepositoryError,
        RepositoryError::NotFound(_) => ErrorCode::TargetNotFound,
        RepositoryError::Rejected(_) | RepositoryError::Other(_) => ErrorCode::RepositoryError,
    }
}

fn first_error(batch: &BatchOperation) -> Option<ErrorCode> {
    batch
        .item_results
        .iter()
        .find(|r| r.outcome == ItemOutcome::Failed)
        .and_then(|r| r.error)
}
