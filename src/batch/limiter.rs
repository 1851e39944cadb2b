//! Bounded-concurrency gate for dispatch tasks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Counting permit pool sized to the configured concurrency.
///
/// With a zero limit there is no semaphore at all and `acquire` never waits,
/// but in-flight dispatches are still counted.
#[derive(Debug, Clone)]
pub(crate) struct ConcurrencyLimiter {
    max_concurrency: usize,
    semaphore: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
}

/// Held by a dispatch task for the duration of its callback.
///
/// Dropping it, on any exit path including unwinding, returns the permit.
#[derive(Debug)]
pub(crate) struct DispatchPermit {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            semaphore: (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency))),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot. Blocks the caller while the pool is saturated.
    pub(crate) async fn acquire(&self) -> DispatchPermit {
        let permit = match &self.semaphore {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                // never closed, so unreachable in practice
                Err(_) => {
                    warn!("Concurrency semaphore closed, dispatching without a permit");
                    None
                }
            },
            None => None,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);

        DispatchPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.semaphore
            .as_ref()
            .is_some_and(|semaphore| semaphore.available_permits() == 0)
    }

    pub(crate) fn max_concurrency(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_limited_acquire_blocks_when_saturated() {
        let limiter = ConcurrencyLimiter::new(2);
        assert_eq!(limiter.max_concurrency(), Some(2));

        let first = limiter.acquire().await;
        let _second = limiter.acquire().await;
        assert!(limiter.is_saturated());
        assert_eq!(limiter.in_flight(), 2);

        let mut third = task::spawn(limiter.acquire());
        assert_pending!(third.poll());

        drop(first);
        assert!(third.is_woken());
        let _third = assert_ready!(third.poll());
        assert_eq!(limiter.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.max_concurrency(), None);

        let permits: Vec<_> = futures::future::join_all((0..64).map(|_| limiter.acquire())).await;
        assert!(!limiter.is_saturated());
        assert_eq!(limiter.in_flight(), 64);

        drop(permits);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_permit_released_on_unwind() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let limiter = ConcurrencyLimiter::new(1);

        let held = limiter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.block_on(async move {
                let _permit = held.acquire().await;
                panic!("callback blew up");
            })
        }));

        assert!(result.is_err());
        assert_eq!(limiter.in_flight(), 0);
        assert!(!limiter.is_saturated());
    }
}
