//! Docbatch Engine - asynchronous batch operations over document trees
//!
//! Accepts delete/move/copy batches against a project's tree, validates
//! them up front and runs them in the background:
//! - `coordinator`: submission, idempotency, progress, cancellation, undo
//! - `expander` / `preflight`: target expansion and per-target checks
//! - `executor`: per-item mutation with conflict policies, retries,
//!   deadlines and atomic rollback
//! - `undo`: the undo log and compensating actions
//! - `store`: batch records with lock-free snapshot reads
//! - `memory`: in-memory collaborators for simulation and tests
//!
//! # Example
//!
//! ```rust,no_run
//! use docbatch_core::{EngineConfig, NodeId, OperationType, SubmitRequest, UserId};
//! use docbatch_engine::{memory::MemoryBackend, BatchCoordinator};
//!
//! # async fn demo() -> docbatch_core::Result<()> {
//! let backend = MemoryBackend::new();
//! let coordinator = BatchCoordinator::new(EngineConfig::default(), backend.collaborators());
//! let request = SubmitRequest::new("project-1", OperationType::Delete, vec![NodeId::new("f1")]);
//! let response = coordinator.submit(&UserId::new("alice"), request).await?;
//! let progress = coordinator.get_progress(response.batch_id)?;
//! println!("{:?}: {}/{}", progress.status, progress.processed, progress.total);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cancel;
pub mod collaborators;
pub mod conflict;
pub mod coordinator;
pub mod executor;
pub mod expander;
pub mod memory;
pub mod preflight;
pub mod progress;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod undo;

pub use cancel::CancelToken;
pub use collaborators::{
    Collaborators, DocumentRepository, EventBus, LockService, Mutation, MutationOutcome, PermissionChecker,
};
pub use coordinator::{validate_request, BatchCoordinator, SubmitResponse, ValidatedRequest};
pub use progress::ProgressTracker;
pub use store::{BatchQuery, BatchStore, MemoryBatchStore};
pub use telemetry::init_tracing;
pub use undo::{UndoLog, UndoManager};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
