//! Best-effort record of sessions that failed to close
//!
//! A stuck or failing session close never fails a conversion. The request id
//! is noted here instead so an external health check can notice engines that
//! are leaking contexts.

use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct CloseFailures {
    ids: Arc<Mutex<Vec<u64>>>,
}

impl CloseFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, request_id: u64) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request_id);
    }

    /// Request ids recorded so far
    pub fn snapshot(&self) -> Vec<u64> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return and clear the recorded ids
    pub fn take(&self) -> Vec<u64> {
        std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_empty(&self) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
