use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use docbatch_core::{BatchEvent, BatchEventKind, BatchId, EventBusError};

use crate::collaborators::EventBus;

/// Event bus that keeps every published event for inspection
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<BatchEvent>>,
    failing: AtomicBool,
}

impl RecordingEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().clone()
    }

    /// Kinds published for one batch, in publication order
    #[must_use]
    pub fn kinds(&self, batch_id: &BatchId) -> Vec<BatchEventKind> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.batch_id == batch_id)
            .map(|event| event.kind)
            .collect()
    }

    /// Reject publications (nothing is recorded while failing)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: BatchEvent) -> Result<(), EventBusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventBusError::PublishFailed(format!("{:?} for {}", event.kind, event.batch_id)));
        }
        tracing::debug!(batch_id = %event.batch_id, kind = ?event.kind, "event recorded");
        self.events.lock().push(event);
        Ok(())
    }
}
