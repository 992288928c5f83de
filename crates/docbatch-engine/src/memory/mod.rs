//! In-memory collaborator adapters
//!
//! Back the `docbatch simulate` command and the test suites. Each adapter
//! exposes a few knobs (latency, transient failures, lock churn, denied
//! permissions, a failing bus) for exercising the engine's error paths.

mod events;
mod locks;
mod permissions;
mod repository;

pub use events::RecordingEventBus;
pub use locks::MemoryLockService;
pub use permissions::MemoryPermissions;
pub use repository::{MemoryDocumentRepository, SeededTree};

use std::sync::Arc;

use crate::collaborators::Collaborators;

/// One of each in-memory adapter, kept typed for test access
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub repository: Arc<MemoryDocumentRepository>,
    pub locks: Arc<MemoryLockService>,
    pub permissions: Arc<MemoryPermissions>,
    pub events: Arc<RecordingEventBus>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased handles for the engine
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            repository: self.repository.clone(),
            locks: self.locks.clone(),
            permissions: self.permissions.clone(),
            events: self.events.clone(),
        }
    }
}
