//! Request breaker
//!
//! Bounds how much buffered work the resolver will hold for one process:
//! at most `queue_depth` requests waiting for a slot and at most
//! `max_concurrency` forward attempts executing at once. Anything beyond the
//! queue depth is rejected outright so memory stays bounded under a flood.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Concurrency breaker with a bounded pending queue
pub struct Breaker {
    queue_depth: usize,
    max_concurrency: usize,
    slots: Arc<Semaphore>,
    pending: AtomicUsize,
}

struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Breaker {
    /// Create a breaker with the given queue depth and concurrency cap
    pub fn new(queue_depth: usize, max_concurrency: usize) -> Self {
        Self {
            queue_depth,
            max_concurrency,
            slots: Arc::new(Semaphore::new(max_concurrency)),
            pending: AtomicUsize::new(0),
        }
    }

    /// Run `work` under a concurrency slot.
    ///
    /// Fails with [`Error::BreakerFull`] when the pending queue is at
    /// capacity and with [`Error::ContextDone`] when cancelled while waiting
    /// for a slot.
    pub async fn run<T>(
        &self,
        cancel: &CancellationToken,
        work: impl Future<Output = T>,
    ) -> Result<T> {
        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => return Err(Error::ContextDone),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                // All slots busy: join the bounded wait queue.
                if self.pending.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::BreakerFull);
                }
                let _pending_guard = CountGuard(&self.pending);
                tokio::select! {
                    permit = self.slots.acquire() => {
                        permit.map_err(|_| Error::ContextDone)?
                    }
                    _ = cancel.cancelled() => return Err(Error::ContextDone),
                }
            }
        };

        let output = work.await;
        drop(permit);
        Ok(output)
    }

    /// Requests currently waiting for a concurrency slot
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Forward attempts currently executing
    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.slots.available_permits()
    }

    /// Configured queue depth
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Configured concurrency cap
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
