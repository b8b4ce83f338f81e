//! Bulkhead: bounds concurrent in-flight calls to one dependency.

use crate::error::DependencyUnavailable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Largest pool a bulkhead can hold (tokio's semaphore limit).
pub const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Counting permit pool shared by every call to one dependency. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
}

/// Held for the duration of one guarded call. Dropping it frees the slot, so the slot comes
/// back on every exit path, cancellation included.
#[derive(Debug)]
pub struct BulkheadSlot {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    /// Pool of `capacity` slots; callers wait up to `wait` for one to free up.
    ///
    /// Panics if `capacity` exceeds [`MAX_CAPACITY`]; descriptor validation rejects such values.
    pub fn new(capacity: usize, wait: Duration) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity, wait }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Take a slot, or fail fast with `BulkheadFull` once the acquisition wait runs out.
    pub async fn acquire(&self) -> Result<BulkheadSlot, DependencyUnavailable> {
        let permit = if self.wait.is_zero() {
            self.semaphore.clone().try_acquire_owned().ok()
        } else {
            tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned())
                .await
                .ok()
                .and_then(Result::ok)
        };

        match permit {
            Some(permit) => Ok(BulkheadSlot { _permit: permit }),
            None => {
                let in_flight = self.in_flight();
                tracing::warn!(in_flight, max = self.capacity, "bulkhead full");
                Err(DependencyUnavailable::BulkheadFull { in_flight, max: self.capacity })
            }
        }
    }
}
