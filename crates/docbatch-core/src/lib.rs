//! Docbatch Core - domain model for batch document operations
//!
//! Everything the engine and its callers share:
//! - Identifiers, tree nodes and typed operations
//! - The `BatchOperation` aggregate, item results and undo data
//! - The batch lifecycle state machine
//! - Error taxonomy, configuration and lifecycle events
//!
//! # Example
//!
//! ```rust
//! use docbatch_core::{NodeId, OperationType, SubmitRequest};
//!
//! let request = SubmitRequest::new("project-1", OperationType::Delete, vec![NodeId::new("doc-7")])
//!     .with_atomic(true);
//! assert!(request.atomic);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod batch;
pub mod config;
pub mod error;
pub mod event;
pub mod state_machine;
pub mod types;

pub use batch::{
    BatchFailure, BatchOperation, BatchProgress, BatchStatus, ItemOutcome, ItemResult, NewBatch, OutcomeCounts,
    PreflightIssue, PreflightSummary, RecentOutcome, ReversalKind, ReversalRecord, TargetList, UndoData, UndoEntry,
    UndoFailure,
};
pub use config::{ConfigError, EngineConfig, RetryPolicy};
pub use error::{BatchError, ErrorCode, EventBusError, LockServiceError, RecordError, RepositoryError, TransitionError};
pub use event::{BatchEvent, BatchEventKind};
pub use types::{
    BatchId, ConflictPolicy, DocumentNode, NodeId, NodeKind, Operation, OperationType, ParentRef, Placement,
    ProjectId, SubmitRequest, UserId, Version,
};

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with batch records
    pub use crate::{
        BatchError, BatchId, BatchOperation, BatchProgress, BatchStatus, ConflictPolicy, EngineConfig, ItemOutcome,
        NodeId, OperationType, ProjectId, SubmitRequest, UserId, Version,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
