//! Once-only acknowledgement capability.
//!
//! Policy:
//! - the first `ack` / `reject` is forwarded to the transport; later calls
//!   return [`AckError::AlreadySettled`] and are never forwarded;
//! - once the delivery's cancellation signal has fired, both are refused
//!   with [`AckError::Cancelled`] so the message stays eligible for
//!   redelivery;
//! - dropping the last clone of an unsettled handle forwards
//!   [`Settlement::Abandoned`], which transports treat as reject-with-requeue.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use super::CancellationSignal;

/// Outcome forwarded to the transport for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; never redeliver.
    Ack,
    /// Refused. `requeue = false` dead-letters the message.
    Reject { requeue: bool },
    /// Handle dropped unsettled (handler cancelled, panicked, or forgot).
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    #[error("delivery {0} was cancelled; it will be redelivered")]
    Cancelled(u64),

    #[error("transport no longer tracks delivery {0}: {1}")]
    TransportGone(u64, String),
}

type SettleFn = Box<dyn FnOnce(Settlement) -> Result<(), AckError> + Send>;

/// Capability tied 1:1 to one delivered message.
///
/// Clones share one settlement. An unsettled delivery is abandoned when the
/// last clone drops.
#[derive(Clone)]
pub struct AckHandle {
    inner: Arc<AckInner>,
}

struct AckInner {
    delivery_tag: u64,
    cancel: CancellationSignal,
    settle: Mutex<Option<SettleFn>>,
}

impl AckInner {
    fn lock(&self) -> MutexGuard<'_, Option<SettleFn>> {
        self.settle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AckHandle {
    /// Built by transports; `settle` runs at most once.
    pub fn new<F>(delivery_tag: u64, settle: F) -> Self
    where
        F: FnOnce(Settlement) -> Result<(), AckError> + Send + 'static,
    {
        Self::from_parts(
            delivery_tag,
            CancellationSignal::never(),
            Some(Box::new(settle)),
        )
    }

    fn from_parts(delivery_tag: u64, cancel: CancellationSignal, settle: Option<SettleFn>) -> Self {
        Self {
            inner: Arc::new(AckInner {
                delivery_tag,
                cancel,
                settle: Mutex::new(settle),
            }),
        }
    }

    /// Tie the handle to the cancellation signal of the handler it is
    /// given to. Listeners call this before dispatch, before any clone
    /// exists; clones made earlier are left settled.
    pub fn with_cancellation(self, cancel: CancellationSignal) -> Self {
        let settle = self.inner.lock().take();
        Self::from_parts(self.inner.delivery_tag, cancel, settle)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Mark the message processed.
    pub fn ack(&self) -> Result<(), AckError> {
        self.settle_with(Settlement::Ack)
    }

    /// Refuse the message, optionally asking for redelivery.
    pub fn reject(&self, requeue: bool) -> Result<(), AckError> {
        self.settle_with(Settlement::Reject { requeue })
    }

    fn settle_with(&self, settlement: Settlement) -> Result<(), AckError> {
        let tag = self.inner.delivery_tag;
        let settle = {
            let mut slot = self.inner.lock();
            if slot.is_none() {
                return Err(AckError::AlreadySettled(tag));
            }
            if self.inner.cancel.is_cancelled() {
                return Err(AckError::Cancelled(tag));
            }
            slot.take()
        };
        match settle {
            Some(settle) => settle(settlement),
            None => Err(AckError::AlreadySettled(tag)),
        }
    }
}

impl Drop for AckInner {
    fn drop(&mut self) {
        let slot = self.settle.get_mut().unwrap_or_else(|e| e.into_inner());
        let Some(settle) = slot.take() else {
            return;
        };
        if !self.cancel.is_cancelled() {
            warn!(
                delivery_tag = self.delivery_tag,
                "Delivery dropped without ack or reject, requeueing"
            );
        }
        if let Err(e) = settle(Settlement::Abandoned) {
            warn!(delivery_tag = self.delivery_tag, error = %e, "Failed to requeue abandoned delivery");
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("settled", &self.is_settled())
            .finish()
    }
}
