//! Admission gate bounding concurrent dispatches
//!
//! A counting gate over a Tokio semaphore. Permits are scoped: dropping an
//! [`AdmissionPermit`] returns it, so every exit path of a dispatch (normal
//! return, handler panic, cancellation, task abort) releases exactly one permit.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Admission errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The gate was closed during shutdown
    #[error("admission gate is closed")]
    Closed,
}

/// One admitted slot; released on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Counting gate shared by all poll loops of a worker
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Take a free slot without waiting
    pub fn try_acquire(&self) -> Result<Option<AdmissionPermit>, AdmissionError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(AdmissionPermit { _permit: permit })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Reject all pending and future acquisitions
    ///
    /// Permits already handed out stay valid and are still returned on drop.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
