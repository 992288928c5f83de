//! Ports to the external collaborators the engine consumes
//!
//! The engine never owns tree storage, editing locks, access control or
//! event fan-out. It talks to them through these traits; `crate::memory`
//! holds reference adapters.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use docbatch_core::{
    BatchEvent, DocumentNode, EventBusError, LockServiceError, NodeId, ProjectId, RepositoryError, UserId, Version,
};

/// Single-node write issued against the document repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Hide the node; the record is kept for restoration
    SoftDelete,
    /// Bring a soft-deleted node back with the given record's fields and placement
    Restore(DocumentNode),
    /// Reparent and/or reorder; `None` parent is the project root, `None` position appends
    Move {
        parent: Option<NodeId>,
        position: Option<usize>,
    },
    /// Create a shallow clone under `parent`
    Clone {
        parent: Option<NodeId>,
        position: Option<usize>,
    },
    /// Permanently remove a childless node
    Purge,
}

/// Repository acknowledgement of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Version after the write
    pub version: Version,
    /// Node created by the write (clones only)
    pub created: Option<NodeId>,
}

/// Document tree storage
///
/// Writes to one node are serialized by the repository itself.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Live node, or `None` if absent or soft-deleted
    async fn read(&self, id: &NodeId) -> Result<Option<DocumentNode>, RepositoryError>;

    /// Live child IDs in sibling order; `None` parent lists the project root
    async fn children(&self, project_id: &ProjectId, parent: Option<&NodeId>) -> Result<Vec<NodeId>, RepositoryError>;

    /// Current version tag (the version oracle)
    async fn version(&self, id: &NodeId) -> Result<Option<Version>, RepositoryError>;

    /// Apply one mutation
    async fn mutate(&self, id: &NodeId, mutation: Mutation) -> Result<MutationOutcome, RepositoryError>;
}

/// Collaborative editing locks; authoritative, never bypassed
#[async_trait]
pub trait LockService: Send + Sync {
    /// Current lock owner, if the node is locked
    async fn lock_owner(&self, id: &NodeId) -> Result<Option<UserId>, LockServiceError>;
}

/// Authorization checks
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether the user may submit batches against the project
    async fn can_edit_project(&self, user: &UserId, project_id: &ProjectId) -> bool;

    /// Whether the user may mutate one node
    async fn can_mutate(&self, user: &UserId, id: &NodeId) -> bool;
}

/// Lifecycle event sink; failures are logged by the caller and otherwise ignored
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: BatchEvent) -> Result<(), EventBusError>;
}

/// The full set of collaborators one engine instance is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn DocumentRepository>,
    pub locks: Arc<dyn LockService>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub events: Arc<dyn EventBus>,
}

impl Collaborators {
    /// Publish within `budget` and log failures; never propagates
    pub(crate) async fn publish(&self, event: BatchEvent, budget: Duration) {
        let kind = event.kind;
        let batch_id = event.batch_id;
        match tokio::time::timeout(budget, self.events.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%batch_id, ?kind, error = %err, "event publication failed"),
            Err(_) => tracing::warn!(%batch_id, ?kind, budget_ms = budget.as_millis(), "event publication timed out"),
        }
    }

    /// Lock owner other than `user`, if any
    pub(crate) async fn foreign_lock(&self, id: &NodeId, user: &UserId) -> Result<Option<UserId>, LockServiceError> {
        Ok(self.locks.lock_owner(id).await?.filter(|owner| owner != user))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
