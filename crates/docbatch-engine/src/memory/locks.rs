use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use docbatch_core::{LockServiceError, NodeId, UserId};

use crate::collaborators::LockService;

/// Editing locks held in memory
#[derive(Debug, Default)]
pub struct MemoryLockService {
    owners: DashMap<NodeId, UserId>,
    unavailable: AtomicBool,
}

impl MemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `id` for `owner`, replacing any previous holder
    pub fn lock(&self, id: &NodeId, owner: &UserId) {
        self.owners.insert(id.clone(), owner.clone());
    }

    pub fn unlock(&self, id: &NodeId) {
        self.owners.remove(id);
    }

    /// Make every query fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn lock_owner(&self, id: &NodeId) -> Result<Option<UserId>, LockServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockServiceError::Unavailable("lock service offline".to_string()));
        }
        Ok(self.owners.get(id).map(|owner| owner.value().clone()))
    }
}
