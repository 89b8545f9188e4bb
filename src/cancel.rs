//! Cooperative cancellation for a single conversion
//!
//! Cancelling never interrupts an engine call that is already in flight. The
//! pipeline polls the signal after each suspension point and discards whatever
//! result the interrupted call produced.

use crate::{Error, Result};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Cancellation flag plus the reason it was raised
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Fails with [`Error::InvalidState`] if it was already raised.
    pub fn cancel(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.reason.set(reason).map_err(|rejected| {
            Error::InvalidState(format!(
                "request already cancelled; refusing second cancel ({})",
                rejected
            ))
        })?;
        self.token.cancel();
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// `Err(Error::Cancelled)` once the signal has been raised
    pub fn check(&self) -> Result<()> {
        match self.reason.get() {
            Some(reason) => Err(Error::Cancelled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Resolves when the signal is raised
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}
