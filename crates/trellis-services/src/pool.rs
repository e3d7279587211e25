//! Worker pool — the node's single capacity gate.
//!
//! Inbound connection handlers and locally originated sends draw from the
//! same set of slots, so heavy inbound load slows the node's own housekeeping
//! and vice versa. The pool is congested when every slot is taken and at
//! least one piece of work is waiting: an originated send, or an accepted
//! connection with no handler yet. Inbound handlers check this after each
//! reply and exit early to hand their slot over.
//!
//! The accept loop reserves its next slot with [`WorkerPool::reserve`],
//! which is not counted as waiting: an idle listener is not pending work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::transport::TransportError;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: AtomicUsize::new(0),
        })
    }

    /// Wait for a free slot, counted as waiting until one is granted.
    pub async fn acquire(&self) -> Result<WorkerPermit, TransportError> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitGuard(&self.waiting);
        self.reserve().await
    }

    /// Wait for a free slot without counting as waiting.
    pub async fn reserve(&self) -> Result<WorkerPermit, TransportError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::PoolClosed)?;
        Ok(WorkerPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Saturated with someone queued behind.
    pub fn is_congested(&self) -> bool {
        self.is_saturated() && self.waiting() > 0
    }

    /// Refuse all further acquisitions. Waiters fail with `PoolClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn congestion_needs_a_waiter() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.unwrap();
        assert!(pool.is_saturated());
        assert!(!pool.is_congested());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.waiting() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(pool.is_congested());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.waiting(), 0);
        assert!(!pool.is_saturated());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_counted() {
        let pool = WorkerPool::new(1);
        let _held = pool.acquire().await.unwrap();
        let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn reserving_is_not_waiting() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.unwrap();

        let reserver = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.is_saturated());
        assert_eq!(pool.waiting(), 0);
        assert!(!pool.is_congested());

        drop(held);
        reserver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let pool = WorkerPool::new(2);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(TransportError::PoolClosed)));
        assert!(matches!(pool.reserve().await, Err(TransportError::PoolClosed)));
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        let _p = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 1);
        assert!(pool.is_saturated());
    }
}
