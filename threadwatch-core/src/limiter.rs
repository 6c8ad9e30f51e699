use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// RAII guard for one slot of a [`Gate`].
///
/// Dropping it releases the slot and decrements the active count.
pub struct Guard {
    #[allow(dead_code)]
    permit: Option<OwnedSemaphorePermit>,
    active: Arc<AtomicUsize>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").finish()
    }
}

/// A counting gate, optionally bounded.
///
/// An unbounded gate only counts holders; a bounded one makes
/// [`Self::acquire`] wait until a slot is free.
#[derive(Debug, Clone)]
pub struct Gate {
    name: &'static str,
    semaphore: Option<Arc<Semaphore>>,
    capacity: Option<usize>,
    active: Arc<AtomicUsize>,
}

impl Gate {
    pub fn counting(name: &'static str) -> Self {
        Self {
            name,
            semaphore: None,
            capacity: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            semaphore: Some(Arc::new(Semaphore::new(capacity))),
            capacity: Some(capacity),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn acquire(&self) -> Guard {
        let permit = match &self.semaphore {
            // The semaphore is never closed, so acquisition only fails if
            // that invariant is broken; fall back to counting.
            Some(semaphore) => {
                if semaphore.available_permits() == 0 {
                    debug!(gate = self.name, active = self.active(), "waiting for a free slot");
                }
                Arc::clone(semaphore).acquire_owned().await.ok()
            }
            None => None,
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        Guard {
            permit,
            active: Arc::clone(&self.active),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Guard> {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(Arc::clone(semaphore).try_acquire_owned().ok()?),
            None => None,
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(Guard {
            permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Holders right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// The two gates used during a refresh run.
#[derive(Debug, Clone)]
pub struct ResourceLimiters {
    /// Full fetches in flight; bounded only by the worker pool.
    pub fulls: Gate,
    /// Image downloads in flight.
    pub images: Gate,
}

impl ResourceLimiters {
    pub fn new(image_slots: usize) -> Self {
        Self {
            fulls: Gate::counting("fulls"),
            images: Gate::bounded("images", image_slots),
        }
    }
}
