//! Per-session stream limits

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps concurrent streams on one session, across both directions
#[derive(Debug, Clone)]
pub struct StreamLimit {
    semaphore: Arc<Semaphore>,
    max_streams: usize,
}

impl StreamLimit {
    #[must_use]
    pub fn new(max_streams: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_streams)),
            max_streams,
        }
    }

    /// Take a slot, or `None` when every slot is in use.
    pub fn try_reserve(&self) -> Option<StreamSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| StreamSlot { _permit: permit })
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Held by a stream for its whole lifetime
#[derive(Debug)]
pub struct StreamSlot {
    _permit: OwnedSemaphorePermit,
}
